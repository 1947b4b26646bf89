// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The nonce chain attached to each token.
//!
//! Every signing submission must present the nonce handed out by the previous submission (the
//! empty string for the first one). Only the HMAC of the expected nonce is kept. A wrong nonce
//! means the submission may be a replay, and the caller revokes the whole token.

use std::sync::Arc;

use tracing::instrument;

use crate::{
    error::TokenError,
    server::{
        crypto,
        kv::KeyValueStore,
        token::{nonce_key, TokenAuthority},
    },
};

/// The number of random bytes in each nonce.
const NONCE_BYTES: usize = 16;

impl TokenAuthority {
    /// Advance the nonce chain for `token`.
    ///
    /// If `presented` is the nonce the chain expects, a fresh nonce is generated, remembered as
    /// the next expected nonce, and returned. If it isn't, or the token is unknown, `None` is
    /// returned and the chain is left alone; the caller should then [`TokenAuthority::revoke`]
    /// the token.
    ///
    /// Checking the presented nonce and advancing the chain is a single atomic step, locally or
    /// in the shared store, so each nonce is accepted at most once across every coordinator
    /// sharing the store.
    ///
    /// The token itself is not verified here; call [`TokenAuthority::verify`] first.
    #[instrument(skip_all, err, fields(token = crypto::b64_sha1(token.as_bytes())))]
    pub async fn next_nonce(
        &self,
        token: &str,
        presented: &str,
    ) -> Result<Option<String>, TokenError> {
        match &self.shared {
            Some(shared) => self.next_shared_nonce(shared, token, presented).await,
            None => self.next_local_nonce(token, presented),
        }
    }

    fn next_local_nonce(&self, token: &str, presented: &str) -> Result<Option<String>, TokenError> {
        let mut tokens = self.tokens.lock().expect("token table lock is poisoned");
        let Some(entry) = tokens.get_mut(token) else {
            tracing::info!("No nonce chain for unknown token");
            return Ok(None);
        };
        let Some(expected) = entry.nonce_digest.as_deref() else {
            tracing::info!("Token has no nonce chain");
            return Ok(None);
        };
        if !crypto::verify_data(presented.as_bytes(), expected, &self.secrets)? {
            tracing::warn!("Presented nonce doesn't match the expected nonce");
            return Ok(None);
        }

        let (next, digest) = self.fresh_nonce()?;
        entry.nonce_digest = Some(digest);
        tracing::debug!("Nonce chain advanced");

        Ok(Some(next))
    }

    async fn next_shared_nonce(
        &self,
        shared: &Arc<dyn KeyValueStore>,
        token: &str,
        presented: &str,
    ) -> Result<Option<String>, TokenError> {
        let Some(entry) = self.lookup(token).await? else {
            tracing::info!("No nonce chain for unknown token");
            return Ok(None);
        };
        let key = nonce_key(token);
        let Some(expected) = shared.get(&key).await.map_err(TokenError::SharedStore)? else {
            tracing::info!("Token has no nonce chain");
            return Ok(None);
        };
        if !crypto::verify_data(presented.as_bytes(), &expected, &self.secrets)? {
            tracing::warn!("Presented nonce doesn't match the expected nonce");
            return Ok(None);
        }

        let (next, digest) = self.fresh_nonce()?;
        let ttl = entry.claims.remaining(self.clock.now());
        let advanced = shared
            .compare_and_swap(&key, &expected, &digest, ttl)
            .await
            .map_err(TokenError::SharedStore)?;
        if !advanced {
            tracing::warn!("Presented nonce was spent by a concurrent request");
            return Ok(None);
        }
        if let Some(local) = self
            .tokens
            .lock()
            .expect("token table lock is poisoned")
            .get_mut(token)
        {
            local.nonce_digest = Some(digest);
        }
        tracing::debug!("Nonce chain advanced");

        Ok(Some(next))
    }

    /// Generate a nonce, returning it and the digest to remember for it.
    fn fresh_nonce(&self) -> Result<(String, String), TokenError> {
        let next = crypto::random_b64(NONCE_BYTES)?;
        let digest = crypto::sign_data(next.as_bytes(), self.primary_secret())?;
        Ok((next, digest))
    }
}
