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

/// Use `debug_assert!` by default. Use `assert!` when feature "strict_assertions" is enabled.
#[macro_export]
macro_rules! strict_assert {
    ($($arg:tt)*) => {
        #[cfg(feature = "strict_assertions")]
        assert!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert!($($arg)*);
    }
}

/// Use `debug_assert_eq!` by default. Use `assert_eq!` when feature "strict_assertions" is enabled.
#[macro_export]
macro_rules! strict_assert_eq {
    ($($arg:tt)*) => {
        #[cfg(feature = "strict_assertions")]
        assert_eq!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert_eq!($($arg)*);
    }
}
