// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The periodic sweep that keeps the store and the token table consistent.
//!
//! Each sweep makes three independent passes:
//!
//! 1. Uploaded content that no longer matches its hash, or that hasn't been accessed within the
//!    maximum file age, is removed.
//! 2. Signed content (and signing logs) with no uploaded counterpart is removed.
//! 3. Expired tokens and their nonce chains are removed.
//!
//! A failure in one pass, or on one file, is logged and the sweep carries on.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    error::StoreError,
    server::{
        crypto,
        store::{remove_if_exists, ContentStore, FILENAME_SUFFIX, LOG_SUFFIX, TEMP_PREFIX},
        token::TokenAuthority,
    },
};

/// Request counters, logged by every sweep.
#[derive(Debug, Default)]
pub struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    uploads: AtomicU64,
}

impl Stats {
    /// A download succeeded.
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A download was requested for content the server has never seen.
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// An upload was accepted.
    pub fn upload(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }
}

/// What a sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub corrupt: usize,
    pub stale: usize,
    pub orphaned: usize,
    pub expired_tokens: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    store: ContentStore,
    tokens: Arc<TokenAuthority>,
    stats: Arc<Stats>,
    max_file_age: Duration,
}

impl Sweeper {
    pub fn new(
        store: ContentStore,
        tokens: Arc<TokenAuthority>,
        stats: Arc<Stats>,
        max_file_age: Duration,
    ) -> Self {
        Self {
            store,
            tokens,
            stats,
            max_file_age,
        }
    }

    /// Sweep every `interval`, starting immediately, until `halt_token` is cancelled.
    pub async fn run(self, interval: Duration, halt_token: CancellationToken) {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = halt_token.cancelled() => break,
                _ = ticks.tick() => {},
            }
            self.sweep().await;
        }
        tracing::debug!("Sweeper stopped");
    }

    /// Make one pass over the store and the token table.
    #[instrument(skip_all, name = "sweep")]
    pub async fn sweep(&self) -> SweepReport {
        tracing::info!(
            hits = self.stats.hits(),
            misses = self.stats.misses(),
            uploads = self.stats.uploads(),
            tokens = self.tokens.len(),
            "Request statistics"
        );

        let mut report = SweepReport::default();
        if let Err(error) = self.sweep_inbound(&mut report).await {
            tracing::error!(?error, "Failed to sweep uploaded files");
        }
        if let Err(error) = self.sweep_signed(&mut report).await {
            tracing::error!(?error, "Failed to sweep signed files");
        }
        report.expired_tokens = self.tokens.expire_stale();

        if report.is_empty() {
            tracing::debug!("Sweep found nothing to remove");
        } else {
            tracing::info!(?report, "Sweep complete");
        }
        report
    }

    async fn sweep_inbound(&self, report: &mut SweepReport) -> Result<(), StoreError> {
        let mut entries = tokio::fs::read_dir(self.store.unsigned_directory()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let checks_content = !name.ends_with(FILENAME_SUFFIX) && !name.starts_with(TEMP_PREFIX);

            if checks_content {
                match self.store.hash_file(&path).await {
                    Ok(actual) if actual == name => {}
                    Ok(actual) => {
                        tracing::warn!(file = name, actual, "Removing file with bad hash");
                        self.remove(&path).await;
                        report.corrupt += 1;
                        continue;
                    }
                    Err(error) => {
                        tracing::error!(?error, file = name, "Unable to hash file");
                        continue;
                    }
                }
            }

            if self.is_stale(&path).await {
                tracing::info!(file = name, "Removing file not accessed recently");
                self.remove(&path).await;
                report.stale += 1;
            }
        }

        Ok(())
    }

    async fn sweep_signed(&self, report: &mut SweepReport) -> Result<(), StoreError> {
        let mut formats = tokio::fs::read_dir(self.store.signed_directory()).await?;
        loop {
            let format = match formats.next_entry().await {
                Ok(Some(format)) => format,
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(?error, "Unable to list signing formats");
                    break;
                }
            };
            let format_name = format.file_name().to_string_lossy().into_owned();
            match format.file_type().await {
                Ok(file_type) if file_type.is_dir() => {}
                Ok(_) => continue,
                Err(error) => {
                    tracing::warn!(?error, format = format_name, "Unable to read file type");
                    continue;
                }
            }

            if let Err(error) = self.sweep_format(&format.path(), &format_name, report).await {
                tracing::warn!(?error, format = format_name, "Failed to sweep signed files");
            }
        }

        Ok(())
    }

    async fn sweep_format(
        &self,
        directory: &Path,
        format_name: &str,
        report: &mut SweepReport,
    ) -> Result<(), StoreError> {
        let mut entries = tokio::fs::read_dir(directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                if self.is_stale(&path).await {
                    tracing::info!(format = format_name, file = name, "Removing abandoned temporary file");
                    self.remove(&path).await;
                    report.stale += 1;
                }
                continue;
            }

            let hash = name.strip_suffix(LOG_SUFFIX).unwrap_or(&name);
            if crypto::is_sha1_hex(hash) {
                match self.store.has_inbound(hash).await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(error) => {
                        tracing::warn!(
                            ?error,
                            format = format_name,
                            file = name,
                            "Unable to check for the unsigned file"
                        );
                        continue;
                    }
                }
            }
            tracing::info!(format = format_name, file = name, "Removing signed file with no unsigned file");
            self.remove(&path).await;
            report.orphaned += 1;
        }

        Ok(())
    }

    async fn is_stale(&self, path: &Path) -> bool {
        let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(error) => {
                tracing::debug!(?error, path = %path.display(), "Unable to read modification time");
                return false;
            }
        };
        SystemTime::now()
            .duration_since(modified)
            .is_ok_and(|age| age > self.max_file_age)
    }

    async fn remove(&self, path: &Path) {
        if let Err(error) = remove_if_exists(path).await {
            tracing::error!(?error, path = %path.display(), "Failed to remove file");
        }
    }
}
