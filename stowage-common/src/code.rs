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

/// Error raised by entity encoding or decoding.
pub type CodingError = anyhow::Error;
/// Result of entity encoding or decoding.
pub type CodingResult<T> = std::result::Result<T, CodingError>;

/// A domain value that can be kept in the write-back cache and persisted into a key/value store.
///
/// The cache never interprets the bytes. It only requires that:
///
/// - [`StoredEntity::storage_key`] is stable for the lifetime of the logical record.
/// - [`StoredEntity::storage_value`] is deterministic: encoding the same logical state twice yields the same bytes.
pub trait StoredEntity: Send + Sync + 'static + Sized {
    /// The key the entity is stored under, relative to the cache realm.
    fn storage_key(&self) -> Bytes;

    /// The encoded value of the entity.
    fn storage_value(&self) -> Bytes;

    /// Reconstruct the entity from its key and encoded value.
    ///
    /// With a key-only cache, `value` is always empty.
    fn from_key_value(key: &[u8], value: &[u8]) -> CodingResult<Self>;
}

/// A raw key/value pair is the simplest entity.
impl StoredEntity for (Bytes, Bytes) {
    fn storage_key(&self) -> Bytes {
        self.0.clone()
    }

    fn storage_value(&self) -> Bytes {
        self.1.clone()
    }

    fn from_key_value(key: &[u8], value: &[u8]) -> CodingResult<Self> {
        Ok((Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_pair_encoding_is_idempotent() {
        let pair = (Bytes::from_static(b"k"), Bytes::from_static(b"v"));
        assert_eq!(pair.storage_value(), pair.storage_value());

        let decoded = <(Bytes, Bytes)>::from_key_value(&pair.storage_key(), &pair.storage_value()).unwrap();
        assert_eq!(decoded, pair);
    }
}
