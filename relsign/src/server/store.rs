// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Content-addressed storage for uploaded and signed artifacts.
//!
//! The layout on disk is:
//!
//! ```text
//! <state directory>/
//!   unsigned/<hash>             uploaded content, named by its SHA-1 digest
//!   unsigned/<hash>.fn          the original filename of the upload
//!   signed/<format>/<hash>      the signed counterpart of unsigned/<hash>
//!   signed/<format>/<hash>.out  the signing program's output for the last job
//! ```
//!
//! Nothing is ever written under its final name directly. Content is written to a temporary file
//! in the destination directory and renamed into place once complete, so readers never observe
//! a partial artifact. Temporary files start with a `.` and are cleaned up by the sweeper if a
//! crash leaves one behind.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use tempfile::TempPath;
use tokio::{io::AsyncWriteExt, sync::Semaphore};
use tracing::instrument;

use crate::{
    error::StoreError,
    server::{config::Config, crypto},
};

/// Suffix of the sidecar file holding an upload's original filename.
pub const FILENAME_SUFFIX: &str = ".fn";

/// Suffix of the signing program's output log.
pub const LOG_SUFFIX: &str = ".out";

/// Prefix of temporary files in the store.
pub const TEMP_PREFIX: &str = ".";

/// The artifact store.
#[derive(Debug, Clone)]
pub struct ContentStore {
    unsigned: PathBuf,
    signed: PathBuf,
    formats: BTreeSet<String>,
    min_filesize: u64,
    max_filesize: u64,
    cross_format_promotion: bool,
    hashing: Arc<Semaphore>,
}

/// A signed artifact, opened for reading.
#[derive(Debug)]
pub struct SignedArtifact {
    pub file: tokio::fs::File,
    pub size: u64,
    /// The hex SHA-1 digest of the signed content.
    pub digest: String,
}

impl ContentStore {
    /// Open the store described by `config`, creating its directories as needed.
    pub async fn new(config: &Config) -> Result<Self, StoreError> {
        let store = Self {
            unsigned: config.unsigned_directory(),
            signed: config.signed_directory(),
            formats: config.formats.keys().cloned().collect(),
            min_filesize: config.security.min_filesize,
            max_filesize: config.security.max_filesize,
            cross_format_promotion: config.signing.cross_format_promotion,
            hashing: Arc::new(Semaphore::new(config.storage.hash_concurrency.get())),
        };

        tokio::fs::create_dir_all(&store.unsigned).await?;
        for format in &store.formats {
            tokio::fs::create_dir_all(store.signed.join(format)).await?;
        }

        Ok(store)
    }

    pub fn unsigned_directory(&self) -> &Path {
        &self.unsigned
    }

    pub fn signed_directory(&self) -> &Path {
        &self.signed
    }

    fn inbound_path(&self, hash: &str) -> Result<PathBuf, StoreError> {
        if !crypto::is_sha1_hex(hash) {
            return Err(StoreError::InvalidHash(hash.to_string()));
        }
        Ok(self.unsigned.join(hash))
    }

    fn filename_path(&self, hash: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.inbound_path(hash)?.into_os_string();
        path.push(FILENAME_SUFFIX);
        Ok(path.into())
    }

    fn format_directory(&self, format: &str) -> Result<PathBuf, StoreError> {
        if !self.formats.contains(format) {
            return Err(StoreError::UnknownFormat(format.to_string()));
        }
        Ok(self.signed.join(format))
    }

    fn signed_path(&self, hash: &str, format: &str) -> Result<PathBuf, StoreError> {
        if !crypto::is_sha1_hex(hash) {
            return Err(StoreError::InvalidHash(hash.to_string()));
        }
        Ok(self.format_directory(format)?.join(hash))
    }

    /// The path of the signing log for `hash` in `format`.
    pub fn log_path(&self, hash: &str, format: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.signed_path(hash, format)?.into_os_string();
        path.push(LOG_SUFFIX);
        Ok(path.into())
    }

    /// The path of the uploaded content for `hash`, if it exists.
    pub async fn inbound(&self, hash: &str) -> Result<Option<PathBuf>, StoreError> {
        let path = self.inbound_path(hash)?;
        Ok(tokio::fs::try_exists(&path).await?.then_some(path))
    }

    pub async fn has_inbound(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.inbound(hash).await?.is_some())
    }

    pub async fn has_signed(&self, hash: &str, format: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.signed_path(hash, format)?).await?)
    }

    /// Compute the hex SHA-1 digest of the file at `path`.
    ///
    /// Hashing runs on the blocking thread pool, and at most `hash_concurrency` files are hashed
    /// at once.
    pub async fn hash_file(&self, path: &Path) -> Result<String, StoreError> {
        let _permit = self
            .hashing
            .acquire()
            .await
            .map_err(std::io::Error::other)?;
        let path = path.to_path_buf();
        Ok(blocking(move || crypto::sha1_file(&path)).await?)
    }

    /// Check the uploaded content for `hash` still hashes to `hash`.
    ///
    /// Returns true if the entry exists and is intact. A corrupt entry is removed.
    #[instrument(skip(self), err)]
    pub async fn verify_inbound(&self, hash: &str) -> Result<bool, StoreError> {
        let Some(path) = self.inbound(hash).await? else {
            return Ok(false);
        };

        let actual = self.hash_file(&path).await?;
        if actual != hash {
            tracing::warn!(actual, "Uploaded file is corrupt; removing it");
            remove_if_exists(&path).await?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Stream `body` into the store as the content for `hash`.
    ///
    /// The content is written to a temporary file. If it's smaller than the minimum size, larger
    /// than the maximum size, or doesn't hash to `hash`, the temporary file is removed and any
    /// existing entry for `hash` is left untouched. Otherwise `filename` is recorded and the
    /// content is renamed into place.
    #[instrument(skip(self, body), err)]
    pub async fn put_inbound<B>(&self, hash: &str, filename: &str, body: B) -> Result<u64, StoreError>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let path = self.inbound_path(hash)?;
        let unsigned = self.unsigned.clone();
        let (file, temp_path) = blocking(move || {
            tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(".upload")
                .tempfile_in(unsigned)
        })
        .await?
        .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut body = body;
        let mut hasher = crypto::ContentHasher::new();
        let mut size: u64 = 0;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|error| StoreError::Stream(error.to_string()))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            size += data.len() as u64;
            if size > self.max_filesize {
                return Err(StoreError::TooLarge {
                    limit: self.max_filesize,
                });
            }
            hasher.update(&data);
            file.write_all(&data).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if size < self.min_filesize {
            return Err(StoreError::SizeTooSmall {
                size,
                minimum: self.min_filesize,
            });
        }
        let actual = hasher.finish();
        if actual != hash {
            return Err(StoreError::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }

        self.save_filename(hash, filename).await?;
        blocking(move || temp_path.persist(path).map_err(|error| error.error)).await?;
        tracing::info!(size, "Stored upload");

        Ok(size)
    }

    /// Record `filename` as the original name of the content for `hash`.
    pub async fn save_filename(&self, hash: &str, filename: &str) -> Result<(), StoreError> {
        let destination = self.filename_path(hash)?;
        let directory = self.unsigned.clone();
        let filename = filename.to_string();
        blocking(move || write_atomically(&directory, &destination, filename.as_bytes())).await?;
        Ok(())
    }

    /// The original filename of the content for `hash`, if one was recorded.
    ///
    /// Reading the filename counts as an access for the purpose of retention.
    pub async fn filename(&self, hash: &str) -> Result<Option<String>, StoreError> {
        let path = self.filename_path(hash)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(filename) => {
                touch(&path).await?;
                Ok(Some(filename))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Open the signed content for `hash` in `format`.
    ///
    /// The signed file and its unsigned counterpart both count as accessed.
    #[instrument(skip(self), err)]
    pub async fn get(&self, hash: &str, format: &str) -> Result<SignedArtifact, StoreError> {
        let path = self.signed_path(hash, format)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound)
            }
            Err(error) => return Err(error.into()),
        };
        let size = file.metadata().await?.len();
        let digest = self.hash_file(&path).await?;

        touch(&path).await?;
        let inbound = self.inbound_path(hash)?;
        if let Err(error) = touch(&inbound).await {
            tracing::debug!(?error, "Unable to refresh the unsigned file's access time");
        }

        Ok(SignedArtifact { file, size, digest })
    }

    /// Create an empty temporary file for a signing program to write its output to.
    ///
    /// The file is removed when the returned path is dropped, unless it's passed to
    /// [`ContentStore::promote`].
    pub async fn scratch(&self, format: &str) -> Result<TempPath, StoreError> {
        let directory = self.format_directory(format)?;
        let path = blocking(move || {
            tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(".partial")
                .tempfile_in(directory)
                .map(|file| file.into_temp_path())
        })
        .await?;
        Ok(path)
    }

    /// Store the signing program's output for `hash` in `format`.
    ///
    /// The output is also stored as unsigned content under its own digest, and as already-signed
    /// content for `format` under that digest, so that submitting the signed file again is a
    /// no-op. If cross-format promotion is enabled it is offered as already signed for every
    /// other format, too.
    ///
    /// Returns the digest of the output.
    #[instrument(skip(self, output), err)]
    pub async fn promote(
        &self,
        hash: &str,
        format: &str,
        output: TempPath,
    ) -> Result<String, StoreError> {
        let destination = self.signed_path(hash, format)?;
        let output_hash = self.hash_file(&output).await?;
        blocking(move || output.persist(destination).map_err(|error| error.error)).await?;
        let source = self.signed_path(hash, format)?;

        let mut copies = vec![
            (self.unsigned.clone(), self.inbound_path(&output_hash)?),
            (
                self.format_directory(format)?,
                self.signed_path(&output_hash, format)?,
            ),
        ];
        if self.cross_format_promotion {
            for other in self.formats.iter().filter(|other| *other != format) {
                copies.push((
                    self.format_directory(other)?,
                    self.signed_path(&output_hash, other)?,
                ));
            }
        }

        for (directory, copy) in copies {
            if tokio::fs::try_exists(&copy).await? {
                continue;
            }
            let source = source.clone();
            blocking(move || copy_atomically(&directory, &source, &copy)).await?;
        }
        tracing::info!(output_hash, "Stored signed output");

        Ok(output_hash)
    }
}

/// Run blocking file system work on the blocking thread pool.
async fn blocking<F, T>(f: F) -> std::io::Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
}

fn write_atomically(directory: &Path, destination: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(destination).map_err(|error| error.error)?;
    Ok(())
}

fn copy_atomically(directory: &Path, source: &Path, destination: &Path) -> std::io::Result<()> {
    let mut file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(directory)?;
    std::io::copy(&mut std::fs::File::open(source)?, file.as_file_mut())?;
    file.as_file().sync_all()?;
    file.persist(destination).map_err(|error| error.error)?;
    Ok(())
}

/// Set the modification time of `path` to now.
pub(crate) async fn touch(path: &Path) -> std::io::Result<()> {
    let path = path.to_path_buf();
    blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(path)?
            .set_modified(SystemTime::now())
    })
    .await
}

/// Remove the file at `path`, succeeding if it doesn't exist.
pub(crate) async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}
