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

//! Shared components and utils for stowage.

/// Allow enable debug assertions in release profile with feature "strict_assertion".
pub mod assert;
/// The trait for the entities the cache keeps and persists.
pub mod code;
/// Error type and result alias.
pub mod error;
/// Event listener.
pub mod event;
/// The metrics model and registries.
pub mod metrics;
/// Runtime and spawner utils.
pub mod runtime;
/// Scoped functional programming extensions.
pub mod scope;
