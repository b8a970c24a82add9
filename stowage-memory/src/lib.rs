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

//! The write-back cache engine of stowage.
//!
//! Entries are loaded once per key, shared through refcounted handles, and persisted in batches by a background
//! writer when they become idle.

mod cache;
mod config;
mod entry;
mod eviction;
mod leak;
mod lock;
mod partition;
mod record;
mod shared;
mod writer;

mod prelude;
pub use prelude::*;

/// Entities and listeners for tests.
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

