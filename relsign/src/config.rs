// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::{Path, PathBuf};

use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode, SslVersion};
use serde::{Deserialize, Serialize};

/// Credentials required to authenticate connections.
///
/// It is highly recommended that you use systemd credentials to ensure the private key is
/// only accessible to the service using it. If the paths provided are relative, it is assumed
/// to be relative to the `$CREDENTIALS_DIRECTORY` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// The systemd credentials ID of the PEM-encoded private key file.
    ///
    /// This private key is the key that matches the `certificate` and is presented to build
    /// machines connecting to the coordinator. It is expected to be provided by systemd's
    /// "ImportCredential" or "LoadCredentialEncrypted" option.
    ///
    /// # Example
    ///
    /// To prepare the encrypted configuration:
    ///
    /// ```bash
    /// systemd-creds encrypt /secure/ramfs/private-key.pem /etc/credstore.encrypted/relsign.private_key
    /// ```
    ///
    /// This will produce an encrypted blob which will be decrypted by systemd at runtime.
    pub private_key: PathBuf,
    /// The path to the certificate that matches the `private_key`.
    pub certificate: PathBuf,
    /// The path to the certificate authority to use when verifying client certificates.
    pub ca_certificate: PathBuf,
}

impl Credentials {
    /// Build a TLS acceptor which requires clients to present a certificate issued by the
    /// configured certificate authority.
    pub(crate) fn ssl_acceptor(&self) -> anyhow::Result<SslAcceptor> {
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        let client_ca_cert = openssl::x509::X509::from_pem(
            std::fs::read_to_string(&self.ca_certificate)?.as_bytes(),
        )?;
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        acceptor.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        acceptor.add_client_ca(&client_ca_cert)?;
        acceptor.set_ca_file(&self.ca_certificate)?;
        acceptor.set_private_key_file(&self.private_key, SslFiletype::PEM)?;
        acceptor.set_certificate_file(&self.certificate, SslFiletype::PEM)?;
        acceptor.check_private_key()?;

        Ok(acceptor.build())
    }

    /// Fix up any relative paths in the configuration file to use the provided credentials directory.
    ///
    /// # Errors
    ///
    /// If the referenced files don't exist, an error is returned.
    pub fn with_credentials_dir(&mut self, credentials_dir: &Path) -> anyhow::Result<()> {
        if self.private_key.is_absolute() {
            tracing::warn!(
                private_key = self.private_key.display().to_string(),
                "Path to private key file is absolute; consider using systemd credentials"
            );
        }
        self.private_key = resolve_credential(credentials_dir, &self.private_key)?;
        self.certificate = resolve_credential(credentials_dir, &self.certificate)?;
        self.ca_certificate = resolve_credential(credentials_dir, &self.ca_certificate)?;

        Ok(())
    }
}

/// Resolve a credential path relative to the credentials directory.
///
/// Absolute paths are returned unchanged. Relative paths are joined to `credentials_dir` and
/// must exist.
pub fn resolve_credential(credentials_dir: &Path, credential: &Path) -> anyhow::Result<PathBuf> {
    if credential.is_absolute() {
        return Ok(credential.to_path_buf());
    }

    let path = credentials_dir.join(credential);
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "No credential named '{}' found in credentials directory",
            credential.display()
        ));
    }

    Ok(path)
}

#[cfg(feature = "cli")]
fn private_load_config<T>(path: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    use anyhow::Context;

    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to CONFIGURATION_DIRECTORY, is
/// checked.  If the default config doesn't exist, the [`Default`] implementation is returned. It's
/// expected that CONFIGURATION_DIRECTORY is set via systemd.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
#[cfg(feature = "cli")]
pub fn load_config<T>(path: Option<PathBuf>, default: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        std::env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::warn!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_credentials_must_exist() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::write(dir.path().join("token.secret"), "hunter2")?;

        let resolved = resolve_credential(dir.path(), Path::new("token.secret"))?;
        assert_eq!(resolved, dir.path().join("token.secret"));
        assert!(resolve_credential(dir.path(), Path::new("missing.secret")).is_err());

        let absolute = Path::new("/etc/relsign/absolute.secret");
        assert_eq!(resolve_credential(dir.path(), absolute)?, absolute);

        Ok(())
    }
}
