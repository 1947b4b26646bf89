// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    config::{resolve_credential, Credentials},
    server::acl::IpNetwork,
};

/// Configuration for the relsign server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The socket address to listen on for requests from build machines and token issuers.
    ///
    /// The default is to listen on all interfaces on port 9110.
    pub listen_address: SocketAddr,

    /// The location where the server should store artifacts.
    ///
    /// Uploaded files are kept in `unsigned/` and signed files in `signed/<format>/`. Both are
    /// named by the SHA-1 digest of their content.
    ///
    /// Defaults to "/var/lib/relsign" if not set.
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,

    /// The TLS credentials for the listener. Clients must present a certificate issued by the
    /// configured certificate authority.
    ///
    /// If this is not set, the server speaks plain HTTP. This is only appropriate for testing.
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Access control and token settings.
    pub security: Security,

    /// Artifact retention settings.
    #[serde(default)]
    pub storage: Storage,

    /// How signing programs are run.
    #[serde(default)]
    pub signing: SigningPolicy,

    /// The signing formats this server offers, keyed by the format name used in request paths.
    pub formats: BTreeMap<String, FormatConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    /// Networks allowed to make any request at all, in CIDR notation.
    pub allowed_ips: Vec<IpNetwork>,

    /// Networks allowed to request new tokens. This is usually much narrower than `allowed_ips`,
    /// for example just the hosts that schedule builds.
    pub token_issuer_ips: Vec<IpNetwork>,

    /// Regular expressions the original filename of an upload must match. Patterns are anchored
    /// at the start of the filename, but not at the end.
    pub allowed_filenames: Vec<String>,

    /// The smallest upload, in bytes, that will be accepted.
    pub min_filesize: u64,

    /// The largest upload, in bytes, that will be accepted.
    pub max_filesize: u64,

    /// The longest token lifetime, in seconds, that can be requested.
    pub max_token_age: u64,

    /// The systemd credentials ID of the file containing the secret used to issue tokens.
    pub token_secret: PathBuf,

    /// Credentials IDs of previous token secrets.
    ///
    /// Tokens and nonces issued with these secrets are still accepted, but new tokens are only
    /// issued with `token_secret`. This allows the secret to be rotated without invalidating
    /// tokens already handed out.
    #[serde(default)]
    pub token_secret_fallback: Vec<PathBuf>,

    /// The systemd credentials ID of the file containing the HTTP basic authentication
    /// credentials allowed to request tokens, one `username:password` per line.
    pub token_issuer_credentials: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Storage {
    /// Uploaded files not requested within this many seconds are removed.
    pub max_file_age: u64,

    /// How often, in seconds, to check the store for stale, corrupt, or orphaned files.
    pub cleanup_interval: u64,

    /// The number of files that may be hashed concurrently.
    pub hash_concurrency: NonZeroUsize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningPolicy {
    /// The number of seconds a signing program may run before it is interrupted.
    pub timeout: u64,

    /// The number of seconds to wait after each signal before escalating to the next one.
    pub grace_period: u64,

    /// The number of times a signing program is run before the job is considered failed.
    pub max_attempts: u32,

    /// The number of seconds to wait after the first failed attempt. The delay grows linearly
    /// with each further attempt.
    pub retry_delay: u64,

    /// The number of jobs a worker processes before it exits and a fresh one is started.
    pub jobs_per_worker: NonZeroUsize,

    /// How long, in seconds, a download request waits for a pending job before telling the
    /// caller to try again.
    pub pending_wait: u64,

    /// When a signed file is produced for one format, also offer it as already signed for every
    /// other format.
    ///
    /// This is only safe if every configured format's signing program produces identical output
    /// for an identical input; leave it disabled unless that is true for your formats.
    #[serde(default)]
    pub cross_format_promotion: bool,
}

/// A signing format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    /// The signing program to run.
    ///
    /// It is invoked as `program [args...] <format> <input file> <output file> <filename>`, where
    /// `filename` is the original name of the uploaded file. If the format has a passphrase, it
    /// is written to the program's standard input.
    pub program: PathBuf,

    /// Additional arguments passed before the standard ones.
    #[serde(default)]
    pub args: Vec<String>,

    /// The systemd credentials ID of the file containing the passphrase for this format's key.
    #[serde(default)]
    pub passphrase: Option<PathBuf>,

    /// The maximum number of signing programs of this format to run at once.
    pub concurrency: NonZeroUsize,

    /// Appended to the original filename when naming the signed download, for formats which
    /// produce something other than a signed copy of the input (".asc" for detached signatures,
    /// for example).
    #[serde(default)]
    pub output_suffix: String,

    /// A file to sign when the server starts. If signing it fails, the server refuses to start;
    /// this catches incorrect passphrases early.
    #[serde(default)]
    pub test_file: Option<PathBuf>,
}

impl Config {
    /// The directory holding uploaded files.
    pub fn unsigned_directory(&self) -> PathBuf {
        self.state_directory.join("unsigned")
    }

    /// The directory holding one subdirectory of signed files per format.
    pub fn signed_directory(&self) -> PathBuf {
        self.state_directory.join("signed")
    }
}

impl Storage {
    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.max_file_age)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }
}

impl SigningPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn pending_wait(&self) -> Duration {
        Duration::from_secs(self.pending_wait)
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut formats = BTreeMap::new();
        formats.insert(
            "gpg".to_string(),
            FormatConfig {
                program: PathBuf::from("/usr/libexec/relsign/signscript"),
                args: vec!["--gpgdir".to_string(), "/var/lib/relsign/gnupg".to_string()],
                passphrase: Some(PathBuf::from("relsign.gpg.passphrase")),
                concurrency: NonZeroUsize::new(4).expect("the default should be valid"),
                output_suffix: ".asc".to_string(),
                test_file: None,
            },
        );

        Self {
            listen_address: SocketAddr::from_str("[::]:9110").expect("the default should be valid"),
            state_directory: default_state_directory(),
            credentials: Some(Credentials {
                private_key: PathBuf::from("relsign.private_key.pem"),
                certificate: PathBuf::from("relsign.certificate.pem"),
                ca_certificate: PathBuf::from("relsign.ca_certificate.pem"),
            }),
            security: Security::default(),
            storage: Storage::default(),
            signing: SigningPolicy::default(),
            formats,
        }
    }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            allowed_ips: vec![IpNetwork::from_str("10.0.0.0/8").expect("the default should be valid")],
            token_issuer_ips: vec![
                IpNetwork::from_str("10.0.0.1/32").expect("the default should be valid")
            ],
            allowed_filenames: vec![r".+\.(exe|dll|mar|dmg|tar\.bz2|zip)$".to_string()],
            min_filesize: 10,
            max_filesize: 1024 * 1024 * 1024,
            max_token_age: 3600,
            token_secret: PathBuf::from("relsign.token_secret"),
            token_secret_fallback: vec![],
            token_issuer_credentials: PathBuf::from("relsign.token_issuers"),
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            max_file_age: 60 * 60 * 24,
            cleanup_interval: 60 * 5,
            hash_concurrency: NonZeroUsize::new(4).expect("the default should be valid"),
        }
    }
}

impl Default for SigningPolicy {
    fn default() -> Self {
        Self {
            timeout: 10,
            grace_period: 1,
            max_attempts: 5,
            retry_delay: 5,
            jobs_per_worker: NonZeroUsize::new(10).expect("the default should be valid"),
            pending_wait: 60,
            cross_format_promotion: false,
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("/var/lib/relsign/")
}

/// A secret value read from a credentials file.
///
/// The [`std::fmt::Debug`] implementation doesn't reveal the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The secrets referenced by the configuration.
///
/// These are read once, when the server starts, from the credentials directory.
#[derive(Debug, Clone)]
pub struct Secrets {
    /// The secret used to issue (and verify) tokens and nonces.
    pub token_secret: Secret,
    /// Older secrets which are still accepted when verifying tokens and nonces.
    pub token_secret_fallback: Vec<Secret>,
    /// `username:password` pairs allowed to request tokens.
    pub token_issuer_credentials: Vec<Secret>,
    /// Passphrases keyed by format name.
    pub passphrases: HashMap<String, Secret>,
}

impl Secrets {
    /// Read every secret the configuration refers to.
    ///
    /// # Errors
    ///
    /// An error is returned if any referenced file doesn't exist or isn't valid UTF-8, or if a
    /// secret file is empty.
    pub fn load(config: &Config, credentials_dir: &Path) -> anyhow::Result<Self> {
        let token_secret = read_secret(credentials_dir, &config.security.token_secret)?;
        let token_secret_fallback = config
            .security
            .token_secret_fallback
            .iter()
            .map(|path| read_secret(credentials_dir, path))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let token_issuer_credentials =
            read_secret(credentials_dir, &config.security.token_issuer_credentials)?
                .expose()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(Secret::from)
                .collect::<Vec<_>>();
        if token_issuer_credentials.is_empty() {
            return Err(anyhow::anyhow!("No token issuer credentials are configured"));
        }

        let mut passphrases = HashMap::new();
        for (name, format) in &config.formats {
            if let Some(path) = &format.passphrase {
                passphrases.insert(name.clone(), read_secret(credentials_dir, path)?);
            }
        }

        Ok(Self {
            token_secret,
            token_secret_fallback,
            token_issuer_credentials,
            passphrases,
        })
    }
}

fn read_secret(credentials_dir: &Path, credential: &Path) -> anyhow::Result<Secret> {
    let path = resolve_credential(credentials_dir, credential)?;
    let secret = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read credential '{}'", credential.display()))?;
    let secret = secret.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        return Err(anyhow::anyhow!(
            "The credential '{}' is empty",
            credential.display()
        ));
    }

    Ok(Secret::from(secret))
}

/// A configured signing format, with its passphrase resolved.
#[derive(Debug)]
pub struct Format {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub passphrase: Option<Secret>,
    pub concurrency: NonZeroUsize,
    pub output_suffix: String,
    pub test_file: Option<PathBuf>,
}

/// The closed set of formats the server signs.
///
/// Format names arrive in request paths; anything not in the registry is rejected before it
/// reaches the store or the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    formats: BTreeMap<String, Arc<Format>>,
}

impl FormatRegistry {
    pub fn new(formats: &BTreeMap<String, FormatConfig>, secrets: &Secrets) -> Self {
        let formats = formats
            .iter()
            .map(|(name, format)| {
                let format = Format {
                    name: name.clone(),
                    program: format.program.clone(),
                    args: format.args.clone(),
                    passphrase: secrets.passphrases.get(name).cloned(),
                    concurrency: format.concurrency,
                    output_suffix: format.output_suffix.clone(),
                    test_file: format.test_file.clone(),
                };
                (name.clone(), Arc::new(format))
            })
            .collect();

        Self { formats }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Format>> {
        self.formats.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formats.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Format>> {
        self.formats.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() -> anyhow::Result<()> {
        let config = Config::default();
        let parsed: Config = toml::from_str(&config.to_string())?;
        assert_eq!(parsed.listen_address, config.listen_address);
        assert_eq!(parsed.security.allowed_ips, config.security.allowed_ips);
        assert_eq!(parsed.formats["gpg"].output_suffix, ".asc");

        Ok(())
    }

    #[test]
    fn minimal_config_uses_defaults() -> anyhow::Result<()> {
        let config: Config = toml::from_str(
            r#"
            listen_address = "127.0.0.1:9110"

            [security]
            allowed_ips = ["127.0.0.0/24"]
            token_issuer_ips = ["127.0.0.1/32"]
            allowed_filenames = [".*"]
            min_filesize = 100
            max_filesize = 1048576
            max_token_age = 600
            token_secret = "token.secret"
            token_issuer_credentials = "token.issuers"

            [formats.signcode]
            program = "/usr/bin/signscript"
            concurrency = 2
            "#,
        )?;

        assert!(config.credentials.is_none());
        assert_eq!(config.signing.max_attempts, 5);
        assert_eq!(config.storage.cleanup_interval(), Duration::from_secs(300));
        assert!(config.formats["signcode"].passphrase.is_none());

        Ok(())
    }

    #[test]
    fn secrets_are_read_from_credentials_directory() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::write(dir.path().join("relsign.token_secret"), "primary\n")?;
        std::fs::write(dir.path().join("old.secret"), "previous")?;
        std::fs::write(
            dir.path().join("relsign.token_issuers"),
            "# build scheduler\nscheduler:hunter2\n\nbackup:swordfish\n",
        )?;
        std::fs::write(dir.path().join("relsign.gpg.passphrase"), "correct horse\n")?;

        let mut config = Config::default();
        config.security.token_secret_fallback = vec![PathBuf::from("old.secret")];
        let secrets = Secrets::load(&config, dir.path())?;

        assert_eq!(secrets.token_secret.expose(), "primary");
        assert_eq!(secrets.token_secret_fallback, vec![Secret::from("previous")]);
        assert_eq!(
            secrets.token_issuer_credentials,
            vec![Secret::from("scheduler:hunter2"), Secret::from("backup:swordfish")]
        );
        assert_eq!(secrets.passphrases["gpg"].expose(), "correct horse");
        assert!(!format!("{secrets:?}").contains("hunter2"));

        let registry = FormatRegistry::new(&config.formats, &secrets);
        assert!(registry.contains("gpg"));
        assert!(registry.get("gpg").and_then(|f| f.passphrase.as_ref()).is_some());

        Ok(())
    }

    #[test]
    fn empty_secret_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::write(dir.path().join("relsign.token_secret"), "\n")?;

        let error = read_secret(dir.path(), Path::new("relsign.token_secret"));
        assert!(error.is_err());

        Ok(())
    }
}
