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

use bytes::Bytes;
use stowage_store::{KvStore, MemoryStore, WriteBatch};

fn keys<S: KvStore>(store: &S, prefix: &[u8]) -> Vec<Bytes> {
    let mut res = vec![];
    store
        .iterate_keys(prefix, &mut |k| {
            res.push(Bytes::copy_from_slice(k));
            true
        })
        .unwrap();
    res
}

fn check_contract<S: KvStore>(store: S) {
    let realm = store.with_realm("contract");
    assert_eq!(realm.realm(), &Bytes::from("contract"));

    let mut batch = realm.batched();
    for i in 0..10u8 {
        batch.set(Bytes::from(vec![b'k', i]), Bytes::from(vec![i]));
    }
    batch.delete(Bytes::from(vec![b'k', 9]));
    batch.commit().unwrap();

    assert_eq!(keys(&realm, b"k").len(), 9);
    assert_eq!(realm.get(&[b'k', 3]).unwrap(), Some(Bytes::from(vec![3u8])));
    assert!(!realm.has(&[b'k', 9]).unwrap());
    assert!(keys(&store, b"k").is_empty());

    // Iteration can call back into the store.
    realm
        .iterate(b"k", &mut |k, _| {
            realm.delete(Bytes::copy_from_slice(k)).unwrap();
            true
        })
        .unwrap();
    assert!(keys(&realm, b"").is_empty());

    realm.set(Bytes::from("x"), Bytes::new()).unwrap();
    realm.clear().unwrap();
    assert!(keys(&realm, b"").is_empty());
}

#[test_log::test]
fn test_memory_store_contract() {
    check_contract(MemoryStore::new());
}
