use std::{hash::Hash, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type GateMap<K> = Arc<DashMap<K, Arc<RwLock<()>>>>;

/// Per-key reader/writer gates serializing work on the same key inside this process.
///
/// Holders of a shared guard run concurrently with each other; an exclusive guard
/// waits until every shared guard on the same key is released. A key's entry is
/// dropped once its last guard is released and nobody is waiting on it.
pub struct KeyedGate<K>
where
    K: Eq + Hash,
{
    gates: GateMap<K>,
}

impl<K> Default for KeyedGate<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            gates: Arc::new(DashMap::new()),
        }
    }
}

impl<K> KeyedGate<K>
where
    K: Eq + Hash + Clone,
{
    /// Gate set with no keys.
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, key: &K) -> Arc<RwLock<()>> {
        self.gates.entry(key.clone()).or_default().clone()
    }

    /// Acquire the shared side of the gate for `key`.
    pub async fn shared(&self, key: &K) -> GateGuard<K, OwnedRwLockReadGuard<()>> {
        let guard = self.gate(key).read_owned().await;
        GateGuard::new(self, key, guard)
    }

    /// Acquire the exclusive side of the gate for `key`.
    pub async fn exclusive(&self, key: &K) -> GateGuard<K, OwnedRwLockWriteGuard<()>> {
        let guard = self.gate(key).write_owned().await;
        GateGuard::new(self, key, guard)
    }

    /// Number of keys currently holding or waiting on a gate.
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// True when no key is gated.
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

/// Held side of a gate; releasing it forgets the key when nobody else uses it.
pub struct GateGuard<K, G>
where
    K: Eq + Hash,
{
    guard: Option<G>,
    key: K,
    gates: GateMap<K>,
}

impl<K, G> GateGuard<K, G>
where
    K: Eq + Hash + Clone,
{
    fn new(owner: &KeyedGate<K>, key: &K, guard: G) -> Self {
        Self {
            guard: Some(guard),
            key: key.clone(),
            gates: owner.gates.clone(),
        }
    }
}

impl<K, G> Drop for GateGuard<K, G>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        // The owned guard holds its own reference to the lock; release it first.
        drop(self.guard.take());
        self.gates
            .remove_if(&self.key, |_, gate| Arc::strong_count(gate) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn exclusive_waits_for_shared_holders() {
        let gates = KeyedGate::<u32>::new();
        let shared = gates.shared(&1).await;

        let blocked = timeout(Duration::from_millis(20), gates.exclusive(&1)).await;
        assert!(blocked.is_err());

        drop(shared);
        assert!(
            timeout(Duration::from_millis(20), gates.exclusive(&1))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let gates = KeyedGate::<String>::new();
        let _first = gates.exclusive(&"a".to_string()).await;
        let second = timeout(Duration::from_millis(20), gates.exclusive(&"b".to_string())).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn released_keys_are_forgotten() {
        let gates = KeyedGate::<u32>::new();
        let first = gates.shared(&1).await;
        let second = gates.shared(&1).await;
        let other = gates.exclusive(&2).await;
        assert_eq!(gates.len(), 2);

        drop(first);
        assert_eq!(gates.len(), 2);
        drop(second);
        drop(other);
        assert!(gates.is_empty());
    }

    #[tokio::test]
    async fn waiting_callers_keep_the_key_alive() {
        let gates = Arc::new(KeyedGate::<u32>::new());
        let held = gates.exclusive(&7).await;

        let waiter = {
            let gates = gates.clone();
            tokio::spawn(async move {
                let _guard = gates.exclusive(&7).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(gates.len() <= 1);

        waiter.await.unwrap();
        assert!(gates.is_empty());
    }
}
