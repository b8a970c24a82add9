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

//! stowage - write-back object cache for Rust.
//!
//! A [`Cache`] sits in front of a [`KvStore`]. Concurrent loads of one key share a single store read, entries stay
//! in memory while a [`CacheEntry`] handle refers to them, and changes are persisted in batches by a background
//! writer once entries become idle.
//!
//! ```rust
//! use stowage::{Cache, CacheBuilder, MemoryStore, KvStore};
//!
//! # fn main() -> stowage::Result<()> {
//! let store = MemoryStore::new().with_realm("docs");
//! let cache: Cache<(bytes::Bytes, bytes::Bytes), _> = CacheBuilder::new().with_name("docs").build(store)?;
//!
//! let entry = cache.store((bytes::Bytes::from("k"), bytes::Bytes::from("v")));
//! assert!(entry.is_modified());
//! drop(entry);
//!
//! let entry = cache.load("k");
//! assert_eq!(entry.get()?.map(|pair| pair.1.clone()), Some(bytes::Bytes::from("v")));
//! # Ok(())
//! # }
//! ```

mod prelude;
pub use prelude::*;
