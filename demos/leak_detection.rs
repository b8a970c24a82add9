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

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use stowage::{CacheBuilder, LeakDetectionConfig, LeakListener, LeakReport, MemoryStore};

struct PrintLeaks;

impl LeakListener for PrintLeaks {
    fn on_leak(&self, report: &LeakReport) {
        println!("leak suspected: {report}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cache = CacheBuilder::<(Bytes, Bytes)>::new()
        .with_leak_detection(
            LeakDetectionConfig::enabled()
                .with_max_hold_time(Duration::from_millis(100))
                .with_check_interval(Duration::from_millis(50)),
        )
        .with_leak_listener(Arc::new(PrintLeaks))
        .build(MemoryStore::new())?;

    // Held far longer than allowed: reported once, with this line as the creation site.
    let forgotten = cache.load("forgotten");
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(forgotten);

    cache.close(true).await?;
    Ok(())
}
