//! Latest op per object identity, waiting for a worker.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::op::Op;
use crate::{Error, Result};

struct Entry<K> {
    generation: u64,
    op: Op<K>,
}

pub struct PendingOps<K> {
    entries: Mutex<(u64, HashMap<String, Entry<K>>)>,
}

impl<K> Default for PendingOps<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new((0, HashMap::new())),
        }
    }
}

impl<K> PendingOps<K> {
    fn entries(&self) -> MutexGuard<'_, (u64, HashMap<String, Entry<K>>)> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records `op` for `key`, folding it into any op still waiting.
    ///
    /// An add that arrives while an update is pending is rejected with
    /// [`Error::AddConflict`]; the pending update keeps its old snapshot and
    /// takes the add's object as its new one. An update that arrives while
    /// an add is pending stays an add, since the add has not run yet.
    pub fn stage(&self, key: &str, op: Op<K>) -> Result<()> {
        let mut guard = self.entries();
        let (counter, entries) = &mut *guard;
        *counter += 1;
        let generation = *counter;

        let merged = match (entries.remove(key), op) {
            (Some(Entry { op: Op::Update { old, .. }, .. }), Op::Add(new)) => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        generation,
                        op: Op::Update { old, new },
                    },
                );
                return Err(Error::AddConflict {
                    key: key.to_string(),
                });
            }
            (Some(Entry { op: Op::Add(_), .. }), Op::Update { new, .. }) => Op::Add(new),
            (Some(Entry { op: Op::Update { old, .. }, .. }), Op::Update { new, .. }) => {
                Op::Update { old, new }
            }
            (_, op) => op,
        };
        entries.insert(key.to_string(), Entry { generation, op: merged });
        Ok(())
    }

    /// Current op for `key` with its generation.
    pub fn peek(&self, key: &str) -> Option<(u64, Op<K>)> {
        self.entries()
            .1
            .get(key)
            .map(|e| (e.generation, e.op.clone()))
    }

    /// Removes the op for `key` if nothing newer was staged since `generation`.
    pub fn complete(&self, key: &str, generation: u64) -> bool {
        let mut guard = self.entries();
        match guard.1.get(key) {
            Some(entry) if entry.generation == generation => {
                guard.1.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().1.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn obj(v: &str) -> Arc<String> {
        Arc::new(v.to_string())
    }

    #[test]
    fn test_update_while_add_pending_stays_add() {
        let pending = PendingOps::default();
        pending.stage("k", Op::Add(obj("v1"))).unwrap();
        pending
            .stage(
                "k",
                Op::Update {
                    old: obj("v1"),
                    new: obj("v2"),
                },
            )
            .unwrap();

        let (_, op) = pending.peek("k").unwrap();
        assert!(matches!(&op, Op::Add(o) if o.as_str() == "v2"));
    }

    #[test]
    fn test_add_while_update_pending_is_rejected() {
        let pending = PendingOps::default();
        pending
            .stage(
                "k",
                Op::Update {
                    old: obj("v1"),
                    new: obj("v2"),
                },
            )
            .unwrap();
        let err = pending.stage("k", Op::Add(obj("v3"))).unwrap_err();
        assert!(matches!(err, Error::AddConflict { ref key } if key == "k"));

        let (_, op) = pending.peek("k").unwrap();
        match op {
            Op::Update { old, new } => {
                assert_eq!(old.as_str(), "v1");
                assert_eq!(new.as_str(), "v3");
            }
            other => panic!("expected update, got {}", other.name()),
        }
    }

    #[test]
    fn test_updates_keep_first_old_snapshot() {
        let pending = PendingOps::default();
        for (old, new) in [("v1", "v2"), ("v2", "v3")] {
            pending
                .stage(
                    "k",
                    Op::Update {
                        old: obj(old),
                        new: obj(new),
                    },
                )
                .unwrap();
        }
        let (_, op) = pending.peek("k").unwrap();
        assert!(matches!(op, Op::Update { old, new } if *old == "v1" && *new == "v3"));
    }

    #[test]
    fn test_delete_replaces_anything() {
        let pending = PendingOps::default();
        pending.stage("k", Op::Add(obj("v1"))).unwrap();
        pending.stage("k", Op::Delete(obj("v1"))).unwrap();
        let (_, op) = pending.peek("k").unwrap();
        assert_eq!(op.name(), "delete");
    }

    #[test]
    fn test_complete_ignores_superseded_generation() {
        let pending = PendingOps::default();
        pending.stage("k", Op::Add(obj("v1"))).unwrap();
        let (generation, _) = pending.peek("k").unwrap();

        pending.stage("k", Op::Delete(obj("v1"))).unwrap();
        assert!(!pending.complete("k", generation));
        assert_eq!(pending.len(), 1);

        let (generation, _) = pending.peek("k").unwrap();
        assert!(pending.complete("k", generation));
        assert!(pending.is_empty());
    }
}
