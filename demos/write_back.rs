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

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use stowage::{CacheBuilder, CodingResult, ForEachOptions, KvStore, MemoryStore, StoredEntity};

/// A user profile persisted as JSON under `user/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Profile {
    id: u64,
    name: String,
    visits: u64,
}

impl StoredEntity for Profile {
    fn storage_key(&self) -> Bytes {
        Bytes::from(format!("user/{:08}", self.id))
    }

    fn storage_value(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    fn from_key_value(_: &[u8], value: &[u8]) -> CodingResult<Self> {
        Ok(serde_json::from_slice(value)?)
    }
}

fn init_logging() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let store = MemoryStore::new().with_realm("profiles");
    let cache = CacheBuilder::<Profile>::new()
        .with_name("profiles")
        .with_cache_time(Duration::from_millis(200))
        .with_batch_timeout(Duration::from_millis(20))
        .build(store.clone())?;

    for id in 0..4 {
        cache
            .store(Profile {
                id,
                name: format!("user-{id}"),
                visits: 0,
            })
            .release();
    }

    // Concurrent visits on one profile share the cached object.
    let tasks = (0..8)
        .map(|_| {
            let cache = cache.clone();
            tokio::task::spawn_blocking(move || {
                cache.load("user/00000001").update(|profile| {
                    let mut profile = profile.cloned().unwrap_or(Profile {
                        id: 1,
                        name: "unknown".to_string(),
                        visits: 0,
                    });
                    profile.visits += 1;
                    profile
                })
            })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await??;
    }

    cache.flush().await?;
    println!("in memory: {}, in store: {}", cache.len(), store.total_len());

    cache.for_each(ForEachOptions::default().with_prefix("user/"), |entry| {
        if let Ok(Some(profile)) = entry.get() {
            println!("{} => {} visits", profile.name, profile.visits);
        }
        true
    })?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("in memory after idle eviction: {}", cache.len());

    cache.close(true).await?;
    Ok(())
}
