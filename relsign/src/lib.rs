// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# Relsign

Relsign is a signing coordinator for release pipelines. Build machines are numerous and are not
trusted with signing keys or their passphrases, so instead they upload the artifacts they produce
(executables, archives, update packages) to the coordinator and download signed copies.

## Protocol

Callers first acquire a short-lived token bound to their IP address. Token issuance is limited
to a small set of hosts (typically the build scheduler), which hand tokens to build machines.

Every upload presents the token and a single-use nonce. The first nonce for a new token is the
empty string; each accepted upload returns the next nonce in the `X-Nonce` response header. A
bad token or a replayed nonce revokes the token entirely and the caller must acquire a new one.

Uploaded content is addressed by its SHA-1 digest and signed by an external program configured
per signing format. Callers poll `GET /sign/<format>/<sha1>` until the signed copy is available.

## Components

The [`server`] module contains the coordinator: the token authority, the content store, the job
dispatcher that runs signing programs, the periodic cleanup sweeper, and the HTTP gateway tying
them together.

## Crate features

* **cli** -
  Include the `relsign-server` command-line interface. This is a default feature.
*/

pub mod config;
pub mod error;
pub mod server;

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop accepting new
/// requests. Requests and signing jobs already in progress will be allowed to complete
/// before the process shuts down.
pub async fn signal_handler(
    halt_token: tokio_util::sync::CancellationToken,
) -> Result<(), anyhow::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}
