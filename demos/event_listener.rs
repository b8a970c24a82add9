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

use std::sync::Arc;

use bytes::Bytes;
use stowage::{CacheBuilder, Error, Event, EventListener, MemoryStore};

struct EchoEventListener;

impl EventListener for EchoEventListener {
    type Entity = (Bytes, Bytes);

    fn on_leave(&self, reason: Event, key: &Bytes, value: Option<&Self::Entity>) {
        println!(
            "entry [key = {}] [value = {:?}] left the cache: {reason:?}",
            String::from_utf8_lossy(key),
            value.map(|(_, v)| String::from_utf8_lossy(v).to_string())
        );
    }

    fn on_write_error(&self, error: &Error, entries: usize) {
        println!("failed to persist {entries} entries: {error}");
    }
}

/// Output:
///
/// ```plain
/// entry [key = a] [value = Some("first")] left the cache: Evict
/// entry [key = b] [value = None] left the cache: Remove
/// entry [key = c] [value = Some("third")] left the cache: Clear
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cache = CacheBuilder::<(Bytes, Bytes)>::new()
        .with_event_listener(Arc::new(EchoEventListener))
        .build(MemoryStore::new())?;

    cache.store((Bytes::from("a"), Bytes::from("first"))).release();
    cache.flush().await?;

    let b = cache.store((Bytes::from("b"), Bytes::from("second")));
    b.delete();
    b.release();
    cache.flush().await?;

    let c = cache.put((Bytes::from("c"), Bytes::from("third")));
    cache.prune().await?;
    drop(c);

    cache.close(true).await?;
    Ok(())
}
