// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the Relsign coordinator.

use hyper::StatusCode;

/// Errors issuing, verifying, and revoking tokens.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The requested token lifetime was zero or longer than the configured maximum.
    #[error("token duration must be between 1 and {max} seconds (requested {requested})")]
    InvalidDuration { requested: u64, max: u64 },

    /// OpenSSL failed to compute a signature or produce random bytes.
    #[error("a cryptographic operation failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// The shared key-value store could not be read or updated.
    ///
    /// When a shared store is attached it holds the authoritative token state, so the operation
    /// fails rather than falling back to possibly stale local state.
    #[error("the shared token store failed: {0:#}")]
    SharedStore(anyhow::Error),
}

/// Errors the [`crate::server::store::ContentStore`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The upload was smaller than the configured minimum size.
    ///
    /// Nothing was written to the store.
    #[error("upload is {size} bytes, less than the minimum of {minimum} bytes")]
    SizeTooSmall { size: u64, minimum: u64 },

    /// The upload exceeded the configured maximum size.
    ///
    /// Nothing was written to the store.
    #[error("upload exceeds the maximum of {limit} bytes")]
    TooLarge { limit: u64 },

    /// The digest of the uploaded content did not match the digest the caller claimed.
    ///
    /// The partial upload is discarded. An existing entry under the claimed hash, if any,
    /// is left untouched.
    #[error("content hash {actual} does not match the claimed hash {expected}")]
    HashMismatch { expected: String, actual: String },

    /// No entry exists for the requested hash and format.
    #[error("no such artifact")]
    NotFound,

    /// The hash isn't a lowercase hex-encoded SHA-1 digest.
    ///
    /// Hashes are used as file names, so anything else is refused before touching the disk.
    #[error("'{0}' is not a valid SHA-1 digest")]
    InvalidHash(String),

    /// The format isn't one of the configured signing formats.
    #[error("'{0}' is not a configured signing format")]
    UnknownFormat(String),

    /// The upload stream failed before completing.
    ///
    /// This usually means the client disconnected. The partial upload is discarded.
    #[error("the upload stream failed: {0}")]
    Stream(String),

    /// A general I/O error occurred reading or writing the store.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors running a signing program.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SigningError {
    /// The signing program did not succeed within its attempt budget.
    ///
    /// The `log` contains the output of the final attempt.
    #[error("signing program failed after {attempts} attempts")]
    Failed { attempts: u32, log: String },

    /// The signing program could not be started or supervised.
    #[error("an I/O error occurred running the signing program: {0}")]
    Io(#[from] std::io::Error),

    /// The signed output could not be stored.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Request validation failures.
///
/// These reject a single request; the caller's token remains valid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("Missing {0}")]
    MissingField(&'static str),
    #[error("Bad request")]
    Malformed,
    #[error("Invalid hash")]
    InvalidHash,
    #[error("Unknown format")]
    UnknownFormat,
    #[error("Invalid duration")]
    InvalidDuration,
    #[error("Unacceptable filename")]
    UnacceptableFilename,
    #[error("File too small")]
    FileTooSmall,
    #[error("File too large")]
    FileTooLarge,
    #[error("Hash mismatch")]
    HashMismatch,
}

/// Reasons the gateway rejects a request.
///
/// Authentication and replay failures revoke the caller's token before they are returned.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
    /// The caller's address is not in the relevant allow-list.
    #[error("Forbidden")]
    Forbidden,

    /// The token issuer credentials were missing or wrong.
    #[error("Authorization Required")]
    Unauthorized,

    #[error("Missing token")]
    MissingToken,

    /// The token was unknown, expired, or presented from the wrong address.
    #[error("Invalid token")]
    InvalidToken,

    #[error("Missing nonce")]
    MissingNonce,

    /// The nonce did not match the token's nonce chain.
    #[error("Invalid nonce")]
    InvalidNonce,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The signing program exhausted its retry budget.
    #[error("Signing failed")]
    Signing,

    #[error("Method Not Allowed")]
    MethodNotAllowed,

    #[error("Not Found")]
    NotFound,

    /// Something went wrong in the coordinator itself.
    ///
    /// The details are logged and never sent to the caller.
    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl RequestError {
    /// The HTTP status code for this error.
    ///
    /// The reason phrase is the error's [`std::fmt::Display`] implementation.
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::Forbidden => StatusCode::FORBIDDEN,
            RequestError::Unauthorized => StatusCode::UNAUTHORIZED,
            RequestError::MissingToken
            | RequestError::InvalidToken
            | RequestError::MissingNonce
            | RequestError::InvalidNonce => StatusCode::BAD_REQUEST,
            RequestError::Validation(ValidationError::UnacceptableFilename) => {
                StatusCode::FORBIDDEN
            }
            RequestError::Validation(ValidationError::FileTooLarge) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            RequestError::Validation(_) => StatusCode::BAD_REQUEST,
            RequestError::Signing | RequestError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RequestError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RequestError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl From<TokenError> for RequestError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::InvalidDuration { .. } => ValidationError::InvalidDuration.into(),
            TokenError::Crypto(error) => RequestError::Internal(error.into()),
            TokenError::SharedStore(error) => RequestError::Internal(error),
        }
    }
}

impl From<StoreError> for RequestError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::SizeTooSmall { .. } => ValidationError::FileTooSmall.into(),
            StoreError::TooLarge { .. } => ValidationError::FileTooLarge.into(),
            StoreError::HashMismatch { .. } => ValidationError::HashMismatch.into(),
            StoreError::InvalidHash(_) => ValidationError::InvalidHash.into(),
            StoreError::UnknownFormat(_) => ValidationError::UnknownFormat.into(),
            StoreError::Stream(_) => ValidationError::Malformed.into(),
            StoreError::NotFound => RequestError::NotFound,
            StoreError::Io(error) => RequestError::Internal(error.into()),
        }
    }
}
