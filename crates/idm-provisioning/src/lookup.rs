//! Cache-or-fetch access to related objects.
//!
//! A provisioning call touches the same system, system mapping and schema
//! objects repeatedly (the password fan-out visits one account per system).
//! [`CachedLookup`] memoizes them for the duration of one call; the fetch
//! closure stays the source of truth.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use tokio::sync::Mutex;

/// Memoizing accessor keyed by `K`.
#[derive(Debug)]
pub struct CachedLookup<K, V> {
    entries: Mutex<HashMap<K, Option<V>>>,
}

impl<K, V> Default for CachedLookup<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> CachedLookup<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty lookup.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lookup preloaded with an object already at hand.
    #[must_use]
    pub fn preloaded(key: K, value: V) -> Self {
        let mut entries = HashMap::new();
        entries.insert(key, Some(value));
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Return the cached value for `key`, fetching it on first access.
    ///
    /// Absent objects are cached too. Errors are not cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &K, fetch: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(cached) = self.entries.lock().await.get(key) {
            return Ok(cached.clone());
        }
        let fetched = fetch().await?;
        self.entries
            .lock()
            .await
            .insert(key.clone(), fetched.clone());
        Ok(fetched)
    }

    /// Drop a cached entry.
    pub async fn invalidate(&self, key: &K) {
        self.entries.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fetches_once() {
        let lookup: CachedLookup<u32, String> = CachedLookup::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = lookup
                .get_or_fetch(&1, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(Some("one".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some("one"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preloaded_value_skips_fetch() {
        let lookup = CachedLookup::preloaded(7u32, "seven".to_string());
        let value = lookup
            .get_or_fetch(&7, || async { Err::<Option<String>, _>("should not fetch") })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("seven"));
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let lookup: CachedLookup<u32, String> = CachedLookup::new();
        assert!(lookup
            .get_or_fetch(&1, || async { Err::<Option<String>, _>("boom") })
            .await
            .is_err());
        let value = lookup
            .get_or_fetch(&1, || async { Ok::<_, &str>(Some("ok".to_string())) })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("ok"));
    }
}
