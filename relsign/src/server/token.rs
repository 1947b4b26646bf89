// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The token authority issues short-lived tokens bound to a single caller address.
//!
//! A token is the HMAC-SHA256 of a payload `<caller ip>:<valid from>:<valid to>:<salt>`, keyed
//! with the primary token secret. The payload never leaves the server; callers only ever see
//! the signature, and verification recomputes it from the stored payload.
//!
//! Verification fails closed: any failed check removes the token (and its nonce chain), and the
//! caller has to request a new one.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::instrument;

use crate::{
    error::TokenError,
    server::{config::Secret, crypto, kv::KeyValueStore},
};

/// Keys in the shared key-value store start with this.
const KEY_PREFIX: &str = "signing";

/// The number of random bytes mixed into each token payload.
const SALT_BYTES: usize = 16;

/// A source of the current time, in seconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> u64;
}

/// The system's wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
    }
}

/// What a token grants: access from one address for a window of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claims {
    pub caller_ip: IpAddr,
    pub valid_from: u64,
    pub valid_to: u64,
}

impl Claims {
    /// Parse the claims out of a token payload.
    ///
    /// IPv6 addresses contain colons, so the fields are split from the right.
    fn parse(data: &str) -> Option<Self> {
        let mut fields = data.rsplitn(4, ':');
        let _salt = fields.next()?;
        let valid_to = fields.next()?.parse().ok()?;
        let valid_from = fields.next()?.parse().ok()?;
        let caller_ip = fields.next()?.parse().ok()?;

        Some(Self {
            caller_ip,
            valid_from,
            valid_to,
        })
    }

    fn is_valid_at(&self, now: u64) -> bool {
        self.valid_from <= now && now <= self.valid_to
    }

    /// How long the claims remain valid, never less than a second.
    ///
    /// Used as the time-to-live for entries in the shared store.
    pub(super) fn remaining(&self, now: u64) -> Duration {
        Duration::from_secs(self.valid_to.saturating_sub(now).max(1))
    }
}

/// A live token.
#[derive(Debug, Clone)]
pub(super) struct Entry {
    pub(super) data: String,
    pub(super) claims: Claims,
    /// The signature of the nonce the caller must present next.
    ///
    /// When a shared store is attached its copy of the digest is authoritative, and this is
    /// `None` until this process advances the chain itself.
    pub(super) nonce_digest: Option<String>,
}

/// Issues and verifies tokens.
///
/// Without a shared store, tokens and their nonce chains live in a single local table behind one
/// lock, so a verification never observes a token whose nonce chain is half-updated. With a
/// shared store, every lookup reads the store and nonce chains advance with an atomic
/// compare-and-swap there; the local table only caches token payloads.
///
/// The table lock is never held across a call to the shared store.
#[derive(Debug)]
pub struct TokenAuthority {
    /// The primary secret, followed by any fallback secrets.
    pub(super) secrets: Vec<Secret>,
    max_token_age: u64,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) shared: Option<Arc<dyn KeyValueStore>>,
    pub(super) tokens: Mutex<HashMap<String, Entry>>,
}

impl TokenAuthority {
    /// Create a token authority.
    ///
    /// New tokens and nonces are signed with `primary`; tokens and nonces signed with any of the
    /// `fallback` secrets are still accepted.
    pub fn new(primary: Secret, fallback: Vec<Secret>, max_token_age: u64) -> Self {
        let secrets = std::iter::once(primary).chain(fallback).collect();
        Self {
            secrets,
            max_token_age,
            clock: Arc::new(SystemClock),
            shared: None,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Use `clock` rather than the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Keep tokens and nonce chains in `store`, shared with other coordinators.
    pub fn with_shared_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.shared = Some(store);
        self
    }

    /// The number of tokens in the local table.
    pub fn len(&self) -> usize {
        self.tokens.lock().expect("token table lock is poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(super) fn primary_secret(&self) -> &Secret {
        &self.secrets[0]
    }

    /// Issue a token for `caller_ip`, valid for `duration` seconds starting now.
    ///
    /// The token's nonce chain is seeded so that the first expected nonce is the empty string.
    ///
    /// # Errors
    ///
    /// [`TokenError::InvalidDuration`] if `duration` is zero or exceeds the maximum token age,
    /// and [`TokenError::SharedStore`] if the token can't be recorded in the shared store.
    #[instrument(skip_all, err, fields(%caller_ip, duration = duration))]
    pub async fn issue(&self, caller_ip: IpAddr, duration: u64) -> Result<String, TokenError> {
        if duration == 0 || duration > self.max_token_age {
            return Err(TokenError::InvalidDuration {
                requested: duration,
                max: self.max_token_age,
            });
        }

        let now = self.clock.now();
        let claims = Claims {
            caller_ip: caller_ip.to_canonical(),
            valid_from: now,
            valid_to: now.saturating_add(duration),
        };
        let data = format!(
            "{}:{}:{}:{}",
            claims.caller_ip,
            claims.valid_from,
            claims.valid_to,
            crypto::random_b64(SALT_BYTES)?
        );
        let token = crypto::sign_data(data.as_bytes(), self.primary_secret())?;
        let nonce_digest = crypto::sign_data(b"", self.primary_secret())?;

        if let Some(shared) = &self.shared {
            let ttl = claims.remaining(now);
            shared
                .set_with_ttl(&token_key(&token), &data, ttl)
                .await
                .map_err(TokenError::SharedStore)?;
            shared
                .set_with_ttl(&nonce_key(&token), &nonce_digest, ttl)
                .await
                .map_err(TokenError::SharedStore)?;
        }
        self.tokens.lock().expect("token table lock is poisoned").insert(
            token.clone(),
            Entry {
                data,
                claims,
                nonce_digest: Some(nonce_digest),
            },
        );
        tracing::info!(
            token = crypto::b64_sha1(token.as_bytes()),
            valid_to = claims.valid_to,
            "Issued new token"
        );

        Ok(token)
    }

    /// Returns true if `token` is valid for `caller_ip` right now.
    ///
    /// If the token is outside its validity window, was issued to a different address, or has a
    /// bad signature, it is revoked before returning false.
    ///
    /// # Errors
    ///
    /// [`TokenError::SharedStore`] if the shared store can't be read; the token is left alone.
    #[instrument(skip_all, err, fields(%caller_ip, token = crypto::b64_sha1(token.as_bytes())))]
    pub async fn verify(&self, token: &str, caller_ip: IpAddr) -> Result<bool, TokenError> {
        let Some(entry) = self.lookup(token).await? else {
            tracing::info!("Unknown token");
            return Ok(false);
        };

        let now = self.clock.now();
        let valid = if !entry.claims.is_valid_at(now) {
            tracing::info!(
                now,
                valid_from = entry.claims.valid_from,
                valid_to = entry.claims.valid_to,
                "Token used outside its validity window"
            );
            false
        } else if entry.claims.caller_ip != caller_ip.to_canonical() {
            tracing::warn!(
                issued_to = %entry.claims.caller_ip,
                "Token presented by a different address than it was issued to"
            );
            false
        } else {
            match crypto::verify_data(entry.data.as_bytes(), token, &self.secrets) {
                Ok(true) => true,
                Ok(false) => {
                    tracing::warn!("Token signature doesn't match any accepted secret");
                    false
                }
                Err(error) => {
                    tracing::error!(?error, "Failed to compute token signature");
                    false
                }
            }
        };

        if !valid {
            self.remove(token).await?;
        }
        Ok(valid)
    }

    /// Remove `token` and its nonce chain, locally and from the shared store.
    #[instrument(skip_all, err, fields(token = crypto::b64_sha1(token.as_bytes())))]
    pub async fn revoke(&self, token: &str) -> Result<(), TokenError> {
        self.remove(token).await?;
        tracing::info!("Token revoked");
        Ok(())
    }

    /// Remove every token whose validity window has ended from the local table, returning how
    /// many were removed.
    ///
    /// Entries in the shared store expire on their own.
    pub fn expire_stale(&self) -> usize {
        let now = self.clock.now();
        let mut tokens = self.tokens.lock().expect("token table lock is poisoned");
        let before = tokens.len();
        tokens.retain(|token, entry| {
            let live = entry.claims.valid_to >= now;
            if !live {
                tracing::debug!(
                    token = crypto::b64_sha1(token.as_bytes()),
                    "Removing expired token"
                );
            }
            live
        });

        before - tokens.len()
    }

    /// Find `token`.
    ///
    /// With a shared store the store decides whether the token exists; a token that has
    /// disappeared from it (revoked by another coordinator, or expired) is dropped from the local
    /// table too.
    pub(super) async fn lookup(&self, token: &str) -> Result<Option<Entry>, TokenError> {
        let Some(shared) = &self.shared else {
            return Ok(self
                .tokens
                .lock()
                .expect("token table lock is poisoned")
                .get(token)
                .cloned());
        };

        let data = shared
            .get(&token_key(token))
            .await
            .map_err(TokenError::SharedStore)?;
        let mut tokens = self.tokens.lock().expect("token table lock is poisoned");
        match data.and_then(|data| Claims::parse(&data).map(|claims| (data, claims))) {
            Some((data, claims)) => {
                let entry = tokens.entry(token.to_string()).or_insert_with(|| Entry {
                    data,
                    claims,
                    nonce_digest: None,
                });
                Ok(Some(entry.clone()))
            }
            None => {
                if tokens.remove(token).is_some() {
                    tracing::info!("Token is no longer in the shared store; forgetting it");
                }
                Ok(None)
            }
        }
    }

    async fn remove(&self, token: &str) -> Result<(), TokenError> {
        self.tokens
            .lock()
            .expect("token table lock is poisoned")
            .remove(token);
        if let Some(shared) = &self.shared {
            for key in [token_key(token), nonce_key(token)] {
                shared.delete(&key).await.map_err(TokenError::SharedStore)?;
            }
        }
        Ok(())
    }
}

pub(super) fn token_key(token: &str) -> String {
    format!("{KEY_PREFIX}:tokens:{}", crypto::b64_sha1(token.as_bytes()))
}

pub(super) fn nonce_key(token: &str) -> String {
    format!("{KEY_PREFIX}:nonce:{}", crypto::b64_sha1(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::server::{kv::MemoryStore, test_utils::ManualClock};

    const START: u64 = 1_700_000_000;

    fn authority(clock: &Arc<ManualClock>) -> TokenAuthority {
        TokenAuthority::new(Secret::from("asdfasdf"), vec![], 3600).with_clock(clock.clone())
    }

    fn ip(address: &str) -> IpAddr {
        address.parse().unwrap()
    }

    #[tokio::test]
    async fn duration_must_be_positive_and_bounded() {
        let clock = ManualClock::new(START);
        let tokens = authority(&clock);

        assert!(matches!(
            tokens.issue(ip("1.2.3.4"), 0).await,
            Err(TokenError::InvalidDuration { .. })
        ));
        assert!(matches!(
            tokens.issue(ip("1.2.3.4"), 3601).await,
            Err(TokenError::InvalidDuration { requested: 3601, max: 3600 })
        ));
        assert!(tokens.issue(ip("1.2.3.4"), 3600).await.is_ok());
    }

    #[test]
    fn claims_parse_ipv6() {
        let claims = Claims::parse("2001:db8::1:100:400:c2FsdA").unwrap();
        assert_eq!(claims.caller_ip, ip("2001:db8::1"));
        assert_eq!(claims.valid_from, 100);
        assert_eq!(claims.valid_to, 400);
        assert!(Claims::parse("1.2.3.4:100").is_none());
    }

    #[tokio::test]
    async fn wrong_address_revokes_token() -> anyhow::Result<()> {
        let clock = ManualClock::new(START);
        let tokens = authority(&clock);
        let token = tokens.issue(ip("1.2.3.4"), 300).await?;

        assert!(!tokens.verify(&token, ip("1.2.3.5")).await?);
        assert!(!tokens.verify(&token, ip("1.2.3.4")).await?);
        assert!(tokens.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn verifying_before_the_window_revokes_token() -> anyhow::Result<()> {
        let clock = ManualClock::new(START);
        let tokens = authority(&clock);
        let token = tokens.issue(ip("1.2.3.4"), 300).await?;

        clock.set(START - 1);
        assert!(!tokens.verify(&token, ip("1.2.3.4")).await?);
        clock.set(START);
        assert!(!tokens.verify(&token, ip("1.2.3.4")).await?);

        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_forged_tokens_are_rejected() -> anyhow::Result<()> {
        let clock = ManualClock::new(START);
        let tokens = authority(&clock);
        let token = tokens.issue(ip("1.2.3.4"), 300).await?;

        assert!(!tokens.verify("not-a-token", ip("1.2.3.4")).await?);
        let forger =
            TokenAuthority::new(Secret::from("guess"), vec![], 3600).with_clock(clock.clone());
        let forged = forger.issue(ip("1.2.3.4"), 300).await?;
        assert!(!tokens.verify(&forged, ip("1.2.3.4")).await?);

        assert!(tokens.verify(&token, ip("1.2.3.4")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn mapped_addresses_match() -> anyhow::Result<()> {
        let clock = ManualClock::new(START);
        let tokens = authority(&clock);
        let token = tokens.issue(ip("::ffff:1.2.3.4"), 300).await?;

        assert!(tokens.verify(&token, ip("1.2.3.4")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn fallback_secrets_are_accepted() -> anyhow::Result<()> {
        let clock = ManualClock::new(START);
        let shared = Arc::new(MemoryStore::new());
        let old = TokenAuthority::new(Secret::from("1234567890"), vec![], 3600)
            .with_clock(clock.clone())
            .with_shared_store(shared.clone());
        let token = old.issue(ip("1.2.3.4"), 300).await?;

        let rotated = TokenAuthority::new(
            Secret::from("asdfasdf"),
            vec![Secret::from("1234567890")],
            3600,
        )
        .with_clock(clock.clone())
        .with_shared_store(shared.clone());
        assert!(rotated.verify(&token, ip("1.2.3.4")).await?);

        let forgotten = TokenAuthority::new(Secret::from("asdfasdf"), vec![], 3600)
            .with_clock(clock.clone())
            .with_shared_store(shared.clone());
        assert!(!forgotten.verify(&token, ip("1.2.3.4")).await?);

        Ok(())
    }

    #[tokio::test]
    async fn revocation_reaches_every_coordinator() -> anyhow::Result<()> {
        let clock = ManualClock::new(START);
        let shared = Arc::new(MemoryStore::new());
        let first = authority(&clock).with_shared_store(shared.clone());
        let token = first.issue(ip("1.2.3.4"), 300).await?;
        assert_eq!(shared.len(), 2);

        let second = authority(&clock).with_shared_store(shared.clone());
        assert!(second.verify(&token, ip("1.2.3.4")).await?);
        assert_eq!(second.len(), 1);

        // The second coordinator has the token cached, but the shared store is authoritative.
        first.revoke(&token).await?;
        assert!(shared.is_empty());
        assert!(!second.verify(&token, ip("1.2.3.4")).await?);
        assert!(second.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn expire_stale_removes_only_expired_tokens() -> anyhow::Result<()> {
        let clock = ManualClock::new(START);
        let tokens = authority(&clock);
        tokens.issue(ip("1.2.3.4"), 10).await?;
        let survivor = tokens.issue(ip("1.2.3.4"), 100).await?;

        clock.advance(50);
        assert_eq!(tokens.expire_stale(), 1);
        assert_eq!(tokens.expire_stale(), 0);
        assert_eq!(tokens.len(), 1);
        assert!(tokens.verify(&survivor, ip("1.2.3.4")).await?);

        Ok(())
    }

    proptest! {
        #[test]
        fn tokens_verify_only_inside_their_window(duration in 1_u64..=3600, elapsed in 0_u64..=7200) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let clock = ManualClock::new(START);
            let tokens = authority(&clock);
            let token = runtime.block_on(tokens.issue(ip("1.2.3.4"), duration)).unwrap();

            clock.advance(elapsed);
            let valid = runtime.block_on(tokens.verify(&token, ip("1.2.3.4"))).unwrap();
            prop_assert_eq!(valid, elapsed <= duration);
        }
    }
}
