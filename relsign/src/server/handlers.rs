// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The HTTP interface.
//!
//! ```text
//! POST /token                  issue (or, with `expire`, revoke) a token
//! GET  /sign/<format>/<hash>   download signed content
//! POST /sign/<format>          upload content to be signed
//! ```
//!
//! Uploads are `multipart/form-data` with the text fields `sha1`, `filename`, `token`, and
//! `nonce`, followed by the content in a `filedata` part. The content is streamed into the store
//! as it arrives, so the text fields must come first; fields after `filedata` are ignored.
//!
//! Every request is checked against the allowed networks before anything else happens. Error
//! responses carry the reason both as the HTTP reason phrase and as the plain text body.

use std::{net::IpAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, Limited, StreamBody};
use hyper::{
    body::{Body, Frame},
    ext::ReasonPhrase,
    header::{self, HeaderValue},
    Method, Request, Response, StatusCode,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::instrument;

use crate::{
    error::{RequestError, StoreError, ValidationError},
    server::{
        acl::{FilenamePolicy, IpAllowList},
        cleanup::Stats,
        config::{Config, FormatRegistry, Secret, Secrets},
        crypto,
        dispatch::{Dispatcher, JobStatus, Submission},
        store::ContentStore,
        token::TokenAuthority,
    },
};

pub(crate) type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// The largest token request body, or signing request text field, accepted.
const MAX_FORM_SIZE: usize = 16 * 1024;

/// The multipart field holding the content to sign.
const FILE_FIELD: &str = "filedata";

pub(crate) const NONCE_HEADER: &str = "x-nonce";
pub(crate) const PENDING_HEADER: &str = "x-pending";
pub(crate) const DIGEST_HEADER: &str = "x-sha1-digest";

/// Fields of a token request.
#[derive(Debug, Default, Deserialize)]
struct TokenForm {
    slave_ip: Option<String>,
    duration: Option<String>,
    expire: Option<String>,
}

/// The text fields of a signing request.
#[derive(Debug, Default)]
struct SignForm {
    sha1: Option<String>,
    filename: Option<String>,
    token: Option<String>,
    nonce: Option<String>,
}

impl SignForm {
    fn set(&mut self, name: &str, value: String) {
        match name {
            "sha1" => self.sha1 = Some(value),
            "filename" => self.filename = Some(value),
            "token" => self.token = Some(value),
            "nonce" => self.nonce = Some(value),
            _ => tracing::debug!(field = name, "Ignoring unknown form field"),
        }
    }
}

/// Maps requests onto the token authority, the store, and the dispatcher.
#[derive(Debug)]
pub(crate) struct Gateway {
    allowed_ips: IpAllowList,
    token_issuer_ips: IpAllowList,
    filenames: FilenamePolicy,
    issuer_credentials: Vec<Secret>,
    formats: FormatRegistry,
    tokens: Arc<TokenAuthority>,
    store: ContentStore,
    dispatcher: Dispatcher,
    stats: Arc<Stats>,
    pending_wait: Duration,
}

impl Gateway {
    pub(crate) fn new(
        config: &Config,
        secrets: &Secrets,
        tokens: Arc<TokenAuthority>,
        store: ContentStore,
        dispatcher: Dispatcher,
        stats: Arc<Stats>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            allowed_ips: IpAllowList::new(&config.security.allowed_ips),
            token_issuer_ips: IpAllowList::new(&config.security.token_issuer_ips),
            filenames: FilenamePolicy::new(&config.security.allowed_filenames)?,
            issuer_credentials: secrets.token_issuer_credentials.clone(),
            formats: FormatRegistry::new(&config.formats, secrets),
            tokens,
            store,
            dispatcher,
            stats,
            pending_wait: config.signing.pending_wait(),
        })
    }

    /// Handle a request from `peer`.
    #[instrument(skip_all, fields(%peer, method = %request.method(), path = request.uri().path()))]
    pub(crate) async fn handle<B>(&self, peer: IpAddr, request: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        if !self.allowed_ips.allows(peer) {
            tracing::info!("Request forbidden based on IP address");
            return error_response(&RequestError::Forbidden);
        }

        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let segments = path.trim_start_matches('/').split('/').collect::<Vec<_>>();
        let result = match (&method, segments.as_slice()) {
            (&Method::POST, ["token"]) => self.token(peer, request).await,
            (&Method::GET, ["sign", format, hash]) => self.fetch(format, hash).await,
            (&Method::POST, ["sign", format]) => self.submit(peer, format, request).await,
            (_, ["token"]) | (_, ["sign", _]) | (_, ["sign", _, _]) => {
                Err(RequestError::MethodNotAllowed)
            }
            _ => Err(RequestError::NotFound),
        };

        let response = result.unwrap_or_else(|error| error_response(&error));
        tracing::info!(status = response.status().as_u16(), "Request complete");
        response
    }

    /// Issue or revoke a token.
    #[instrument(skip_all, err)]
    async fn token<B>(
        &self,
        peer: IpAddr,
        request: Request<B>,
    ) -> Result<Response<ResponseBody>, RequestError>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        if !self.token_issuer_ips.allows(peer) {
            tracing::info!("Token request forbidden based on IP address");
            return Err(RequestError::Forbidden);
        }
        if !self.authorized(request.headers().get(header::AUTHORIZATION)) {
            tracing::warn!("Token request with missing or incorrect credentials");
            return Err(RequestError::Unauthorized);
        }

        let body = Limited::new(request.into_body(), MAX_FORM_SIZE)
            .collect()
            .await
            .map_err(|error| {
                tracing::info!(%error, "Unable to read token request body");
                ValidationError::Malformed
            })?
            .to_bytes();
        let form: TokenForm =
            serde_urlencoded::from_bytes(&body).map_err(|_| ValidationError::Malformed)?;

        if let Some(token) = form.expire {
            self.tokens.revoke(&token).await?;
            return Ok(reply(StatusCode::OK, "OK", Bytes::new()));
        }

        let caller_ip = form
            .slave_ip
            .ok_or(ValidationError::MissingField("slave_ip"))?
            .parse::<IpAddr>()
            .map_err(|_| ValidationError::Malformed)?;
        let duration = form
            .duration
            .ok_or(ValidationError::MissingField("duration"))?
            .trim()
            .parse::<u64>()
            .map_err(|_| ValidationError::InvalidDuration)?;
        let token = self.tokens.issue(caller_ip, duration).await?;

        Ok(reply(StatusCode::OK, "OK", Bytes::from(token)))
    }

    /// Returns true if `authorization` holds any of the token issuer credentials.
    fn authorized(&self, authorization: Option<&HeaderValue>) -> bool {
        let Some(encoded) = authorization
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Basic "))
        else {
            return false;
        };
        let Ok(decoded) = openssl::base64::decode_block(encoded.trim()) else {
            return false;
        };

        self.issuer_credentials
            .iter()
            .any(|credential| crypto::constant_time_eq(credential.expose().as_bytes(), &decoded))
    }

    fn check_format(&self, format: &str) -> Result<(), RequestError> {
        if self.formats.contains(format) {
            Ok(())
        } else {
            Err(ValidationError::UnknownFormat.into())
        }
    }

    /// Download signed content.
    ///
    /// If the content has been uploaded but not signed in this format, a job is queued and the
    /// caller is told to come back later.
    #[instrument(skip_all, err, fields(format = format, hash = hash))]
    async fn fetch(&self, format: &str, hash: &str) -> Result<Response<ResponseBody>, RequestError> {
        self.check_format(format)?;
        if !crypto::is_sha1_hex(hash) {
            return Err(ValidationError::InvalidHash.into());
        }

        if let Some(mut handle) = self.dispatcher.pending(hash, format) {
            tracing::debug!("Waiting for pending job");
            if let JobStatus::Failed { .. } = handle.wait(self.pending_wait).await {
                return Err(RequestError::Signing);
            }
        }

        match self.store.get(hash, format).await {
            Ok(artifact) => {
                self.stats.hit();
                let filename = self.store.filename(hash).await?;
                let body = StreamBody::new(ReaderStream::new(artifact.file).map_ok(Frame::data));
                let mut response = Response::new(body.boxed_unsync());
                let headers = response.headers_mut();
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.size));
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                if let Ok(digest) = HeaderValue::from_str(&artifact.digest) {
                    headers.insert(DIGEST_HEADER, digest);
                }
                if let Some(disposition) = filename.and_then(|filename| {
                    let suffix = self
                        .formats
                        .get(format)
                        .map(|format| format.output_suffix.as_str())
                        .unwrap_or_default();
                    content_disposition(&format!("{filename}{suffix}"))
                }) {
                    headers.insert(header::CONTENT_DISPOSITION, disposition);
                }
                Ok(response)
            }
            Err(StoreError::NotFound) => self.not_signed_yet(format, hash).await,
            Err(error) => Err(error.into()),
        }
    }

    async fn not_signed_yet(
        &self,
        format: &str,
        hash: &str,
    ) -> Result<Response<ResponseBody>, RequestError> {
        if self.dispatcher.pending(hash, format).is_some() {
            tracing::info!("Job is still pending");
            return Ok(pending_response());
        }

        // The content may have been uploaded for another format; queue it for this one.
        if self.store.verify_inbound(hash).await? {
            match self.store.filename(hash).await? {
                Some(filename) => {
                    tracing::info!("Content is known; queueing it for this format");
                    self.dispatcher.submit(hash, &filename, format)?;
                    return Ok(pending_response());
                }
                None => tracing::info!("Content is known but its filename is not; it must be resubmitted"),
            }
        } else {
            self.stats.miss();
        }

        Ok(reply(StatusCode::NOT_FOUND, "Not Found", Bytes::new()))
    }

    /// Upload content to be signed.
    #[instrument(skip_all, err, fields(format = format))]
    async fn submit<B>(
        &self,
        peer: IpAddr,
        format: &str,
        request: Request<B>,
    ) -> Result<Response<ResponseBody>, RequestError>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        self.check_format(format)?;
        let boundary = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| multer::parse_boundary(value).ok())
            .ok_or(ValidationError::Malformed)?;
        let constraints = multer::Constraints::new().size_limit(
            multer::SizeLimit::new()
                .per_field(MAX_FORM_SIZE as u64)
                .for_field(FILE_FIELD, u64::MAX),
        );
        let mut multipart = multer::Multipart::with_constraints(
            request.into_body().into_data_stream(),
            boundary,
            constraints,
        );

        let mut form = SignForm::default();
        let file = loop {
            let Some(field) = multipart.next_field().await.map_err(malformed)? else {
                break None;
            };
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name == FILE_FIELD {
                break Some(field);
            }
            form.set(&name, field.text().await.map_err(malformed)?);
        };

        let token = form.token.ok_or(RequestError::MissingToken)?;
        if !self.tokens.verify(&token, peer).await? {
            return Err(RequestError::InvalidToken);
        }
        let Some(nonce) = form.nonce else {
            self.tokens.revoke(&token).await?;
            return Err(RequestError::MissingNonce);
        };
        let Some(next_nonce) = self.tokens.next_nonce(&token, &nonce).await? else {
            self.tokens.revoke(&token).await?;
            return Err(RequestError::InvalidNonce);
        };

        // The chain has advanced, so every response from here on carries the next nonce.
        let mut response = match self
            .accept_upload(format, form.sha1, form.filename, file)
            .await
        {
            Ok(reason) => reply(StatusCode::ACCEPTED, reason, Bytes::from_static(reason.as_bytes())),
            Err(error) => {
                tracing::info!(%error, "Upload rejected");
                error_response(&error)
            }
        };
        if let Ok(value) = HeaderValue::from_str(&next_nonce) {
            response.headers_mut().insert(NONCE_HEADER, value);
        }

        Ok(response)
    }

    /// Store an upload and queue it for signing, returning the reason phrase for the response.
    async fn accept_upload(
        &self,
        format: &str,
        hash: Option<String>,
        filename: Option<String>,
        file: Option<multer::Field<'static>>,
    ) -> Result<&'static str, RequestError> {
        let hash = hash.ok_or(ValidationError::MissingField("sha1"))?;
        if !crypto::is_sha1_hex(&hash) {
            return Err(ValidationError::InvalidHash.into());
        }
        let filename = filename.ok_or(ValidationError::MissingField("filename"))?;
        tracing::info!(hash, filename, "Request to sign");

        if self.store.verify_inbound(&hash).await? {
            if self.store.has_signed(&hash, format).await? {
                tracing::info!("File already exists");
                return Ok("File already exists");
            }
            if self.dispatcher.pending(&hash, format).is_some() {
                tracing::info!("File is pending");
                return Ok("File is pending");
            }
            tracing::info!("File is neither signed nor pending; queueing it again");
        }

        if !self.filenames.allows(&filename) {
            tracing::warn!(filename, "Filename is not allowed");
            return Err(ValidationError::UnacceptableFilename.into());
        }

        let file = file.ok_or(ValidationError::MissingField(FILE_FIELD))?;
        let body = StreamBody::new(file.map_ok(Frame::data));
        self.store.put_inbound(&hash, &filename, body).await?;
        self.stats.upload();
        match self.dispatcher.submit(&hash, &filename, format)? {
            Submission::Queued(_) => Ok("Accepted"),
            Submission::Pending(_) => Ok("File is pending"),
        }
    }
}

fn malformed(error: multer::Error) -> RequestError {
    tracing::info!(%error, "Unable to parse signing request form");
    ValidationError::Malformed.into()
}

/// A response with a plain text body and a custom reason phrase.
fn reply(status: StatusCode, reason: &str, body: Bytes) -> Response<ResponseBody> {
    let mut response = Response::new(
        Full::new(body)
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if status.canonical_reason() != Some(reason) {
        if let Ok(reason) = ReasonPhrase::try_from(reason.as_bytes().to_vec()) {
            response.extensions_mut().insert(reason);
        }
    }
    response
}

fn pending_response() -> Response<ResponseBody> {
    let mut response = reply(StatusCode::NOT_FOUND, "Not Found", Bytes::new());
    response
        .headers_mut()
        .insert(PENDING_HEADER, HeaderValue::from_static("true"));
    response
}

fn error_response(error: &RequestError) -> Response<ResponseBody> {
    if let RequestError::Internal(error) = error {
        tracing::error!(?error, "Internal error handling request");
    }
    let reason = error.to_string();
    let mut response = reply(error.status(), &reason, Bytes::from(reason.clone()));
    if matches!(error, RequestError::Unauthorized) {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"relsign\""),
        );
    }
    response
}

/// Build a `Content-Disposition` header naming the download `filename`.
fn content_disposition(filename: &str) -> Option<HeaderValue> {
    let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
    HeaderValue::from_str(&format!("attachment; filename=\"{escaped}\"")).ok()
}
