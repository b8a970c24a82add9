// Copyright 2026 stowage Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Scoped functional programming extensions.
///
/// Mostly used to keep lock guards confined to a closure:
///
/// ```rust
/// # use parking_lot::Mutex;
/// # use stowage_common::scope::Scope;
/// let counter = Mutex::new(0);
/// let next = counter.lock().with(|mut c| {
///     *c += 1;
///     *c
/// });
/// assert_eq!(next, 1);
/// ```
pub trait Scope {
    /// Scoped with ownership.
    fn with<F, R>(self, f: F) -> R
    where
        Self: Sized,
        F: FnOnce(Self) -> R,
    {
        f(self)
    }
}
impl<T> Scope for T {}
