use std::sync::Arc;

use crate::Listener;

/// A typed operation derived from one delta of the watch stream.
#[derive(Debug)]
pub enum Op<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

impl<K> Clone for Op<K> {
    fn clone(&self) -> Self {
        match self {
            Op::Add(obj) => Op::Add(obj.clone()),
            Op::Update { old, new } => Op::Update {
                old: old.clone(),
                new: new.clone(),
            },
            Op::Delete(obj) => Op::Delete(obj.clone()),
        }
    }
}

impl<K> Op<K> {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add(_) => "add",
            Op::Update { .. } => "update",
            Op::Delete(_) => "delete",
        }
    }

    /// Most recent snapshot carried by the op.
    pub fn object(&self) -> &Arc<K> {
        match self {
            Op::Add(obj) | Op::Delete(obj) => obj,
            Op::Update { new, .. } => new,
        }
    }

    /// Dispatches the op to the matching listener callback.
    pub async fn visit<L>(&self, listener: &L) -> Result<(), L::Error>
    where
        L: Listener<Resource = K>,
    {
        match self {
            Op::Add(obj) => listener.add(obj.clone()).await,
            Op::Update { old, new } => listener.update(old.clone(), new.clone()).await,
            Op::Delete(obj) => listener.delete(obj.clone()).await,
        }
    }
}
