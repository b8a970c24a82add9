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
use hashbrown::HashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use stowage_common::error::hex;

#[derive(Debug, Default)]
struct NodeState {
    /// Retains held on this exact node.
    own: usize,
    /// Retains held on this node and its whole subtree.
    total: usize,
    children: HashMap<Bytes, Node>,
}

type Node = Arc<Mutex<NodeState>>;
type NodeGuard = ArcMutexGuard<RawMutex, NodeState>;

/// A tree of retain counts keyed by key segments.
///
/// Answers "does any live entry share this prefix" without scanning the cache. A node exists exactly as long as its
/// subtree holds at least one retain.
///
/// Every node has its own lock. Walks are hand-over-hand: a child is locked while its parent is still held, and the
/// parent is released right after, so contention is limited to paths sharing a prefix.
#[derive(Debug, Default)]
pub struct RetainTree {
    root: Node,
}

impl RetainTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a retain on the node at `path`, creating missing nodes.
    pub fn retain(&self, path: &[Bytes]) {
        let mut guard = self.root.lock_arc();
        guard.total += 1;
        for segment in path {
            let child = guard.children.entry(segment.clone()).or_default().clone();
            let mut next = child.lock_arc();
            drop(guard);
            next.total += 1;
            guard = next;
        }
        guard.own += 1;
    }

    /// Drop a retain on the node at `path`, removing nodes whose subtree became empty.
    ///
    /// Returns `true` if the node at `path` was removed.
    ///
    /// # Panics
    ///
    /// Panics if `path` holds no retain.
    pub fn release(&self, path: &[Bytes]) -> bool {
        let mut guard = self.root.lock_arc();
        assert!(guard.total > 0, "partition {} released too many times", display(path));
        guard.total -= 1;
        if path.is_empty() {
            assert!(guard.own > 0, "partition {} released too many times", display(path));
            guard.own -= 1;
            return false;
        }

        for (depth, segment) in path.iter().enumerate() {
            let child = match guard.children.get(segment) {
                Some(child) => child.clone(),
                None => panic!("partition {} released too many times", display(path)),
            };
            let mut next: NodeGuard = child.lock_arc();
            next.total -= 1;
            if depth + 1 == path.len() {
                assert!(next.own > 0, "partition {} released too many times", display(path));
                next.own -= 1;
            }
            if next.total == 0 {
                // The detached subtree is only reachable through `next`, check it really held the retain.
                assert!(
                    holds(&next, &path[depth + 1..]),
                    "partition {} released too many times",
                    display(path)
                );
                guard.children.remove(segment);
                return true;
            }
            drop(guard);
            guard = next;
        }
        false
    }

    /// Whether the node at `path` holds retains in its subtree, or any of its ancestors holds a retain itself.
    pub fn is_retained(&self, path: &[Bytes]) -> bool {
        let mut guard = self.root.lock_arc();
        for segment in path {
            if guard.own > 0 {
                return true;
            }
            let child = match guard.children.get(segment) {
                Some(child) => child.clone(),
                None => return false,
            };
            let next = child.lock_arc();
            drop(guard);
            guard = next;
        }
        guard.total > 0
    }

    /// Whether no retain is held at all.
    pub fn is_empty(&self) -> bool {
        self.root.lock().total == 0
    }
}

fn holds(node: &NodeState, rest: &[Bytes]) -> bool {
    match rest.split_first() {
        None => node.own > 0,
        Some((segment, rest)) => node
            .children
            .get(segment)
            .is_some_and(|child| holds(&child.lock(), rest)),
    }
}

fn display(path: &[Bytes]) -> String {
    path.iter().map(|segment| hex(segment)).collect::<Vec<_>>().join("/")
}

/// Split `key` into tree segments of the given sizes. The remainder, if any, is the last segment.
pub fn split_key(key: &Bytes, sizes: &[usize]) -> Vec<Bytes> {
    let mut segments = Vec::with_capacity(sizes.len() + 1);
    let mut offset = 0;
    for &size in sizes {
        if offset >= key.len() {
            return segments;
        }
        let end = (offset + size).min(key.len());
        segments.push(key.slice(offset..end));
        offset = end;
    }
    if offset < key.len() {
        segments.push(key.slice(offset..));
    }
    segments
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn path(segments: &[&'static str]) -> Vec<Bytes> {
        segments.iter().map(|s| Bytes::from_static(s.as_bytes())).collect()
    }

    #[test_log::test]
    fn test_retain_release() {
        let tree = RetainTree::new();
        assert!(tree.is_empty());

        tree.retain(&path(&["a", "b", "c"]));
        tree.retain(&path(&["a", "b", "d"]));

        assert!(tree.is_retained(&path(&["a"])));
        assert!(tree.is_retained(&path(&["a", "b"])));
        assert!(tree.is_retained(&path(&["a", "b", "c"])));
        assert!(!tree.is_retained(&path(&["a", "x"])));
        assert!(!tree.is_retained(&path(&["b"])));

        assert!(tree.release(&path(&["a", "b", "c"])));
        assert!(!tree.is_retained(&path(&["a", "b", "c"])));
        assert!(tree.is_retained(&path(&["a", "b"])));

        assert!(tree.release(&path(&["a", "b", "d"])));
        assert!(!tree.is_retained(&path(&["a"])));
        assert!(tree.is_empty());
    }

    #[test_log::test]
    fn test_ancestor_retain_covers_descendants() {
        let tree = RetainTree::new();
        tree.retain(&path(&["a"]));
        assert!(tree.is_retained(&path(&["a", "anything", "below"])));
        assert!(!tree.is_retained(&path(&["b", "x"])));

        tree.retain(&path(&["a", "b"]));
        assert!(!tree.release(&path(&["a"])));
        assert!(tree.is_retained(&path(&["a"])));
        assert!(!tree.is_retained(&path(&["a", "c"])));
        assert!(tree.release(&path(&["a", "b"])));
        assert!(tree.is_empty());
    }

    #[test_log::test]
    fn test_repeated_retain_keeps_node() {
        let tree = RetainTree::new();
        tree.retain(&path(&["a", "b"]));
        tree.retain(&path(&["a", "b"]));
        assert!(!tree.release(&path(&["a", "b"])));
        assert!(tree.is_retained(&path(&["a", "b"])));
        assert!(tree.release(&path(&["a", "b"])));
        assert!(tree.is_empty());
    }

    #[test_log::test]
    #[should_panic(expected = "released too many times")]
    fn test_over_release_panics() {
        let tree = RetainTree::new();
        tree.retain(&path(&["a"]));
        tree.release(&path(&["a"]));
        tree.release(&path(&["a"]));
    }

    #[test_log::test]
    #[should_panic(expected = "released too many times")]
    fn test_release_of_inner_node_without_own_retain_panics() {
        let tree = RetainTree::new();
        tree.retain(&path(&["a", "b"]));
        tree.release(&path(&["a"]));
    }

    #[test_log::test]
    #[should_panic(expected = "released too many times")]
    fn test_release_of_sibling_path_panics() {
        let tree = RetainTree::new();
        tree.retain(&path(&["a", "b"]));
        tree.release(&path(&["a", "c"]));
    }

    #[test_log::test]
    fn test_concurrent_retain_release() {
        let tree = Arc::new(RetainTree::new());
        let handles = (0..8)
            .map(|i| {
                let tree = tree.clone();
                thread::spawn(move || {
                    let p = path(&["shared", if i % 2 == 0 { "even" } else { "odd" }]);
                    for _ in 0..1000 {
                        tree.retain(&p);
                        assert!(tree.is_retained(&p));
                        tree.release(&p);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(tree.is_empty());
        assert!(!tree.is_retained(&path(&["shared"])));
    }

    #[test]
    fn test_split_key() {
        let key = Bytes::from_static(b"abcdefgh");
        assert_eq!(split_key(&key, &[]), path(&["abcdefgh"]));
        assert_eq!(split_key(&key, &[2, 3]), path(&["ab", "cde", "fgh"]));
        assert_eq!(split_key(&key, &[4, 4]), path(&["abcd", "efgh"]));
        assert_eq!(split_key(&key, &[6, 6]), path(&["abcdef", "gh"]));
        assert_eq!(split_key(&Bytes::new(), &[2]), Vec::<Bytes>::new());
    }
}
