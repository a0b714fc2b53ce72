use bytes::Bytes;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The Store holds every key-value pair of the server. Keys and values are arbitrary bytes.
///
/// A single mutex guards the whole map, so a SET is visible to every GET that starts after it
/// returns and concurrent SETs on one key leave exactly one of the written values behind. The
/// store is cloned cheaply, every clone refers to the same map.
#[derive(Clone)]
pub struct Store {
    inner: Arc<InnerStore>,
}

impl Store {
    pub fn new() -> Store {
        let state = State {
            keys: HashMap::new(),
        };

        Self {
            inner: Arc::new(InnerStore {
                state: Mutex::new(state),
            }),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InnerStore {
    state: Mutex<State>,
}

pub struct InnerStoreLocked<'a> {
    state: MutexGuard<'a, State>,
}

impl<'a> InnerStoreLocked<'a> {
    pub fn set(&mut self, key: Bytes, data: Bytes) {
        self.state.keys.insert(key, data);
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.state.keys.get(key).cloned()
    }

    #[cfg(test)]
    pub fn exists(&self, key: &[u8]) -> bool {
        self.state.keys.contains_key(key)
    }

    #[cfg(test)]
    pub fn size(&self) -> usize {
        self.state.keys.len()
    }
}

impl Deref for Store {
    type Target = InnerStore;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl InnerStore {
    pub fn lock(&self) -> InnerStoreLocked<'_> {
        // Every write is a single insert, so the map is consistent even if a holder panicked.
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        InnerStoreLocked { state }
    }
}

struct State {
    keys: HashMap<Bytes, Bytes>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn set_and_get() {
        let store = Store::new();

        assert_eq!(store.lock().get(b"foo"), None);
        assert!(!store.lock().exists(b"foo"));

        store.lock().set(Bytes::from("foo"), Bytes::from("bar"));

        assert_eq!(store.lock().get(b"foo"), Some(Bytes::from("bar")));
        assert!(store.lock().exists(b"foo"));
        assert_eq!(store.lock().size(), 1);
    }

    #[test]
    fn set_overwrites() {
        let store = Store::new();

        store.lock().set(Bytes::from("foo"), Bytes::from("bar"));
        store.lock().set(Bytes::from("foo"), Bytes::from("baz"));

        assert_eq!(store.lock().get(b"foo"), Some(Bytes::from("baz")));
        assert_eq!(store.lock().size(), 1);
    }

    #[test]
    fn keys_are_opaque_bytes() {
        let store = Store::new();
        let key = Bytes::from_static(b"\xff\x00\r\n");

        store.lock().set(key.clone(), Bytes::from("binary"));

        assert_eq!(store.lock().get(&key), Some(Bytes::from("binary")));
        assert_eq!(store.lock().get(b"\xff\x00"), None);
    }

    #[test]
    fn clones_share_the_same_map() {
        let store = Store::new();
        let clone = store.clone();

        clone.lock().set(Bytes::from("foo"), Bytes::from("bar"));

        assert_eq!(store.lock().get(b"foo"), Some(Bytes::from("bar")));
    }

    #[test]
    fn concurrent_sets_keep_one_value() {
        let store = Store::new();
        let values: Vec<Bytes> = (0..8).map(|i| Bytes::from(format!("value-{}", i))).collect();

        let handles: Vec<_> = values
            .iter()
            .cloned()
            .map(|value| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        store.lock().set(Bytes::from("key"), value.clone());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let value = store.lock().get(b"key").unwrap();
        assert!(values.contains(&value));
        assert_eq!(store.lock().size(), 1);
    }
}
