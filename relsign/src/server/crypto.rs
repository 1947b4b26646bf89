// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The handful of cryptographic primitives the coordinator needs.
//!
//! OpenSSL provides all of them: HMAC-SHA256 for tokens and nonces, SHA-1 for content
//! addressing, and the random number generator for token salts and nonces.

use std::{io::Read, path::Path};

use openssl::{error::ErrorStack, hash::MessageDigest, pkey::PKey, sha::Sha1, sign::Signer};

use crate::server::config::Secret;

/// Base64-encode `data` with the trailing padding removed.
pub fn b64(data: &[u8]) -> String {
    openssl::base64::encode_block(data)
        .trim_end_matches('=')
        .to_string()
}

/// The base64-encoded HMAC-SHA256 of `data` keyed with `secret`.
pub fn sign_data(data: &[u8], secret: &Secret) -> Result<String, ErrorStack> {
    let key = PKey::hmac(secret.expose().as_bytes())?;
    let mut signer = Signer::new(MessageDigest::sha256(), &key)?;
    signer.update(data)?;
    Ok(b64(&signer.sign_to_vec()?))
}

/// Returns true if `signature` is the signature of `data` under any of `secrets`.
///
/// Signatures are compared in constant time.
pub fn verify_data<'a, I>(data: &[u8], signature: &str, secrets: I) -> Result<bool, ErrorStack>
where
    I: IntoIterator<Item = &'a Secret>,
{
    for secret in secrets {
        if constant_time_eq(sign_data(data, secret)?.as_bytes(), signature.as_bytes()) {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Compare two byte strings without leaking where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && openssl::memcmp::eq(a, b)
}

/// `bytes` random bytes, base64-encoded.
pub fn random_b64(bytes: usize) -> Result<String, ErrorStack> {
    let mut buf = vec![0; bytes];
    openssl::rand::rand_bytes(buf.as_mut_slice())?;
    Ok(b64(&buf))
}

/// The base64-encoded SHA-1 of `data`.
///
/// Tokens are stored in the shared key-value store under this digest rather than verbatim.
pub fn b64_sha1(data: &[u8]) -> String {
    b64(&openssl::sha::sha1(data))
}

/// Returns true if `value` looks like a hex-encoded SHA-1 digest as produced by [`sha1_hex`].
pub fn is_sha1_hex(value: &str) -> bool {
    value.len() == 40
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Incrementally computes the lowercase hex SHA-1 digest used to address content.
pub struct ContentHasher {
    inner: Sha1,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self { inner: Sha1::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finish())
    }
}

/// The hex SHA-1 digest of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// The hex SHA-1 digest of the file at `path`.
///
/// This blocks; call it from a blocking task.
pub fn sha1_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0; 512 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hasher.finish())
}
