use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio_util::sync::CancellationToken;

use crate::domain::{ChatId, OrderId};

/// Identity of one watch: who is waiting, for which order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub requester: ChatId,
    pub order_id: OrderId,
}

/// In-flight watches, keyed by `(requester, order_id)`.
///
/// Every operation takes the lock once and releases it before returning, so
/// admission is atomic and nothing is held across a sleep or a query.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    active: Mutex<HashMap<WatchKey, CancellationToken>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `key` unless it is already being watched.
    ///
    /// The returned guard removes the key when dropped, whatever way the
    /// watch ends.
    pub fn admit(self: &Arc<Self>, key: WatchKey) -> Option<SessionGuard> {
        let mut active = self.lock();
        if active.contains_key(&key) {
            return None;
        }
        let cancel = CancellationToken::new();
        active.insert(key.clone(), cancel.clone());
        Some(SessionGuard {
            registry: Arc::clone(self),
            key,
            cancel,
        })
    }

    pub fn contains(&self, key: &WatchKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Cancel every in-flight watch. Keys go away as their tasks unwind.
    pub fn cancel_all(&self) -> usize {
        let active = self.lock();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    fn remove(&self, key: &WatchKey) {
        self.lock().remove(key);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WatchKey, CancellationToken>> {
        // Poisoning can only come from a panic between two map calls; the map itself stays valid.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Scoped ownership of one registry entry.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<WatchRegistry>,
    key: WatchKey,
    cancel: CancellationToken,
}

impl SessionGuard {
    pub fn key(&self) -> &WatchKey {
        &self.key
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(chat: i64, id: &str) -> WatchKey {
        WatchKey {
            requester: ChatId(chat),
            order_id: id.into(),
        }
    }

    #[test]
    fn admits_each_key_once_until_guard_drops() {
        let reg = Arc::new(WatchRegistry::new());

        let guard = reg.admit(key(1, "a")).expect("first admission");
        assert!(reg.admit(key(1, "a")).is_none());

        // Same order for a different requester is a different watch.
        let other = reg.admit(key(2, "a")).expect("other requester");
        assert_eq!(reg.active_count(), 2);

        drop(guard);
        assert!(!reg.contains(&key(1, "a")));
        assert!(reg.admit(key(1, "a")).is_some());
        drop(other);
    }

    #[test]
    fn cancel_all_signals_every_token() {
        let reg = Arc::new(WatchRegistry::new());
        let a = reg.admit(key(1, "a")).unwrap();
        let b = reg.admit(key(1, "b")).unwrap();

        assert_eq!(reg.cancel_all(), 2);
        assert!(a.cancel_token().is_cancelled());
        assert!(b.cancel_token().is_cancelled());
    }
}
