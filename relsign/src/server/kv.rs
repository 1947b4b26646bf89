// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A key-value store used to share token and nonce state between coordinator processes.
//!
//! When a shared store is attached to a [`crate::server::token::TokenAuthority`], it holds the
//! authoritative copy of every token and nonce chain. Each lookup reads it, so a token revoked
//! or a nonce spent on one coordinator is immediately refused by the others. Entries are written
//! with a time-to-live matching the token's remaining lifetime.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// The operations the coordinator needs from a shared key-value store.
///
/// The token authority never holds its own locks while calling these, so implementations are
/// free to perform network I/O.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Fetch the value for `key`, if it exists and hasn't expired.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Store `value` under `key`, replacing any existing value. The entry expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Remove `key`. Removing a key that doesn't exist is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Atomically replace the value of `key` with `new` if it currently holds `expected`.
    ///
    /// Returns false, leaving the store untouched, if `key` holds any other value or doesn't
    /// exist. For Redis this is a short Lua script or a `WATCH`/`MULTI` transaction.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool>;
}

/// A [`KeyValueStore`] held in memory.
///
/// This is useful in tests, and to share token state between several
/// [`crate::server::token::TokenAuthority`] instances in one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries that haven't expired.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("memory store lock is poisoned")
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(entries: &mut HashMap<String, (String, Instant)>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock().expect("memory store lock is poisoned");
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .lock()
            .expect("memory store lock is poisoned")
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .expect("memory store lock is poisoned")
            .remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let mut entries = self.entries.lock().expect("memory store lock is poisoned");
        if Self::live_value(&mut entries, key).as_deref() != Some(expected) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (new.to_string(), Instant::now() + ttl));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store
            .set_with_ttl("signing:tokens:a", "data", Duration::from_secs(60))
            .await?;
        store
            .set_with_ttl("signing:tokens:b", "data", Duration::ZERO)
            .await?;

        assert_eq!(store.get("signing:tokens:a").await?.as_deref(), Some("data"));
        assert_eq!(store.get("signing:tokens:b").await?, None);
        assert_eq!(store.len(), 1);

        store.delete("signing:tokens:a").await?;
        store.delete("signing:tokens:missing").await?;
        assert!(store.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn compare_and_swap_only_replaces_the_expected_value() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set_with_ttl("signing:nonce:a", "first", ttl).await?;

        assert!(!store.compare_and_swap("signing:nonce:a", "stale", "second", ttl).await?);
        assert_eq!(store.get("signing:nonce:a").await?.as_deref(), Some("first"));

        assert!(store.compare_and_swap("signing:nonce:a", "first", "second", ttl).await?);
        assert!(!store.compare_and_swap("signing:nonce:a", "first", "third", ttl).await?);
        assert_eq!(store.get("signing:nonce:a").await?.as_deref(), Some("second"));

        // A missing key is never swapped into existence.
        assert!(!store.compare_and_swap("signing:nonce:b", "", "first", ttl).await?);
        assert_eq!(store.get("signing:nonce:b").await?, None);

        Ok(())
    }
}
