// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Helpers shared by the unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::server::{
    config::{Config, FormatConfig, Secret, Secrets, Security, SigningPolicy, Storage},
    token::Clock,
};

/// A clock that only moves when told to.
#[derive(Debug)]
pub(crate) struct ManualClock(AtomicU64);

impl ManualClock {
    pub(crate) fn new(now: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(now)))
    }

    pub(crate) fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub(crate) fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Write a shell script to `dir`.
///
/// Scripts are run with `/bin/sh <script>` rather than executed directly, which avoids `ETXTBSY`
/// when tests write and run scripts concurrently.
pub(crate) fn script(dir: &Path, name: &str, body: &str) -> std::io::Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}"))?;
    Ok(path)
}

/// A configuration for tests, storing state in `state_directory`.
///
/// Two formats, `fmtA` and `fmtB`, both run `script`. Requests are accepted from the loopback
/// network.
pub(crate) fn config(state_directory: &Path, script: &Path) -> Config {
    let format = FormatConfig {
        program: PathBuf::from("/bin/sh"),
        args: vec![script.display().to_string()],
        passphrase: None,
        concurrency: NonZeroUsize::new(2).unwrap(),
        output_suffix: String::new(),
        test_file: None,
    };
    let mut formats = BTreeMap::new();
    formats.insert("fmtA".to_string(), format.clone());
    formats.insert(
        "fmtB".to_string(),
        FormatConfig {
            output_suffix: ".sig".to_string(),
            ..format
        },
    );

    Config {
        listen_address: "127.0.0.1:0".parse().unwrap(),
        state_directory: state_directory.to_path_buf(),
        credentials: None,
        security: Security {
            allowed_ips: vec!["127.0.0.0/8".parse().unwrap(), "::1".parse().unwrap()],
            token_issuer_ips: vec!["127.0.0.1".parse().unwrap()],
            allowed_filenames: vec![r".*\.bin$".to_string()],
            min_filesize: 10,
            max_filesize: 1024 * 1024,
            max_token_age: 3600,
            ..Security::default()
        },
        storage: Storage::default(),
        signing: SigningPolicy {
            timeout: 5,
            grace_period: 1,
            max_attempts: 2,
            retry_delay: 0,
            jobs_per_worker: NonZeroUsize::new(10).unwrap(),
            pending_wait: 10,
            cross_format_promotion: false,
        },
        formats,
    }
}

/// Secrets matching [`config`].
pub(crate) fn secrets() -> Secrets {
    Secrets {
        token_secret: Secret::from("asdfasdf"),
        token_secret_fallback: vec![],
        token_issuer_credentials: vec![Secret::from("scheduler:hunter2")],
        passphrases: HashMap::new(),
    }
}
