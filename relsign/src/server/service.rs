// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The Relsign server.

use std::{convert::Infallible, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::{TokioIo, TokioTimer};
use openssl::ssl::{Ssl, SslAcceptor};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_openssl::SslStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::server::{
    cleanup::{Stats, Sweeper},
    config::{Config, FormatRegistry, Secrets},
    dispatch::{Dispatcher, Event},
    handlers::Gateway,
    process::RetryPolicy,
    store::ContentStore,
    token::TokenAuthority,
};

/// How long a client has to complete the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a client has to send the request headers.
const HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// A relsign server.
pub struct Server {
    config: Arc<Config>,
    listener: TcpListener,
    tls_config: Option<Arc<SslAcceptor>>,
    gateway: Arc<Gateway>,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedReceiver<Event>,
    sweeper: Sweeper,
}

pub struct Listener {
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    halt_token: CancellationToken,
}

impl Listener {
    /// Stop accepting new connections and wait for existing connections and signing jobs to
    /// complete.
    ///
    /// Signing jobs can run for a long time, so users should wrap this call in a timeout if they
    /// don't have an arbitrarily long time to wait.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;

        Ok(())
    }

    /// Get a cancellation token which can be used to start the graceful shutdown of this
    /// listener.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }
}

impl Server {
    /// Create a new server with a token authority that keeps its state in memory only.
    pub async fn new(config: Config, secrets: Secrets) -> anyhow::Result<Self> {
        let tokens = TokenAuthority::new(
            secrets.token_secret.clone(),
            secrets.token_secret_fallback.clone(),
            config.security.max_token_age,
        );
        Self::with_token_authority(config, secrets, tokens).await
    }

    /// Create a new server using the given token authority.
    ///
    /// This allows the token authority to share its state with other coordinators.
    ///
    /// Every signing format's test file is signed before this returns, so a misconfigured
    /// signing program prevents the server from starting.
    pub async fn with_token_authority(
        config: Config,
        secrets: Secrets,
        tokens: TokenAuthority,
    ) -> anyhow::Result<Self> {
        let tls_config = config
            .credentials
            .as_ref()
            .map(|credentials| credentials.ssl_acceptor().map(Arc::new))
            .transpose()?;
        if tls_config.is_none() {
            tracing::warn!("No TLS credentials are configured; serving plain HTTP");
        }

        let tokens = Arc::new(tokens);
        let store = ContentStore::new(&config).await?;
        let (dispatcher, events) = Dispatcher::new(
            store.clone(),
            FormatRegistry::new(&config.formats, &secrets),
            RetryPolicy::from(&config.signing),
            config.signing.jobs_per_worker.get(),
        );
        dispatcher.self_test().await?;
        tracing::info!("All signing formats passed their self-test");

        let stats = Arc::new(Stats::default());
        let sweeper = Sweeper::new(
            store.clone(),
            tokens.clone(),
            stats.clone(),
            config.storage.max_file_age(),
        );
        let gateway = Gateway::new(
            &config,
            &secrets,
            tokens,
            store,
            dispatcher.clone(),
            stats,
        )?;

        let listener = TcpListener::bind(config.listen_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Listening for requests");

        Ok(Self {
            config: Arc::new(config),
            listener,
            tls_config,
            gateway: Arc::new(gateway),
            dispatcher,
            events,
            sweeper,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the server.
    #[instrument(skip_all, name = "server")]
    pub fn run(self) -> Listener {
        let halt_token = CancellationToken::new();
        let server_halt_token = halt_token.clone();
        let task = tokio::spawn(
            async move {
                let Self {
                    config,
                    listener,
                    tls_config,
                    gateway,
                    dispatcher,
                    events,
                    sweeper,
                } = self;

                let request_tracker = TaskTracker::new();
                let background_tracker = TaskTracker::new();
                let events_halt_token = CancellationToken::new();
                background_tracker.spawn({
                    let dispatcher = dispatcher.clone();
                    let halt_token = events_halt_token.clone();
                    async move { dispatcher.process_events(events, halt_token).await }
                        .instrument(tracing::Span::current())
                });
                background_tracker.spawn(
                    sweeper
                        .run(config.storage.cleanup_interval(), server_halt_token.clone())
                        .instrument(tracing::Span::current()),
                );

                loop {
                    let (stream, peer) = tokio::select! {
                        _ = server_halt_token.cancelled() => {
                            tracing::info!("Shutdown requested, no new requests will be accepted");
                            break;
                        },
                        conn = listener.accept() => match conn {
                            Ok(conn) => conn,
                            Err(error) => {
                                tracing::error!(?error, "Failed to accept incoming connection");
                                tokio::select! {
                                    _ = server_halt_token.cancelled() => {},
                                    _ = tokio::time::sleep(Duration::from_secs(1)) => {},
                                }
                                continue;
                            }
                        },
                    };

                    tracing::debug!(%peer, "New connection accepted");
                    request_tracker.spawn(
                        serve(
                            gateway.clone(),
                            tls_config.clone(),
                            stream,
                            peer,
                            server_halt_token.clone(),
                        )
                        .instrument(tracing::Span::current()),
                    );
                }

                tracing::debug!("Beginning shutdown");
                drop(listener);
                request_tracker.close();
                request_tracker.wait().await;
                tracing::info!("All pending requests are now complete");
                dispatcher.shutdown().await;
                events_halt_token.cancel();
                background_tracker.close();
                background_tracker.wait().await;
                tracing::info!("All signing jobs are now complete");

                Ok::<_, anyhow::Error>(())
            }
            .instrument(tracing::Span::current()),
        );

        Listener { task, halt_token }
    }
}

#[instrument(skip_all, fields(%peer))]
async fn serve(
    gateway: Arc<Gateway>,
    tls_config: Option<Arc<SslAcceptor>>,
    stream: TcpStream,
    peer: SocketAddr,
    halt_token: CancellationToken,
) {
    let Some(tls_config) = tls_config else {
        serve_http(gateway, stream, peer, halt_token).await;
        return;
    };

    let mut stream = match Ssl::new(tls_config.context())
        .and_then(|ssl| SslStream::new(ssl, stream))
    {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "Failed to set up TLS session");
            return;
        }
    };
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut stream).accept()).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::warn!(%error, "TLS handshake failed");
            return;
        }
        Err(_) => {
            tracing::warn!("TLS handshake timed out");
            return;
        }
    }

    serve_http(gateway, stream, peer, halt_token).await;
}

async fn serve_http<S>(
    gateway: Arc<Gateway>,
    stream: S,
    peer: SocketAddr,
    halt_token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request: Request<Incoming>| {
        let gateway = gateway.clone();
        async move { Ok::<_, Infallible>(gateway.handle(peer.ip(), request).await) }
    });
    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = halt_token.cancelled() => {
            tracing::debug!("Closing connection once the current request completes");
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(error) = result {
        tracing::info!(%error, "Connection closed with an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_utils;

    #[tokio::test]
    async fn broken_signing_programs_prevent_startup() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let script = test_utils::script(dir.path(), "sign.sh", "exit 1\n")?;
        let test_file = dir.path().join("test.bin");
        std::fs::write(&test_file, "a file to sign at startup")?;
        let mut config = test_utils::config(&dir.path().join("state"), &script);
        for format in config.formats.values_mut() {
            format.test_file = Some(test_file.clone());
        }

        assert!(Server::new(config, test_utils::secrets()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn halts_when_idle() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let script = test_utils::script(dir.path(), "sign.sh", "cp \"$2\" \"$3\"\n")?;
        let config = test_utils::config(&dir.path().join("state"), &script);

        let server = Server::new(config, test_utils::secrets()).await?;
        let address = server.local_addr()?;
        assert_ne!(address.port(), 0);
        let listener = server.run();

        tokio::time::timeout(Duration::from_secs(5), listener.halt()).await??;
        assert!(TcpStream::connect(address).await.is_err());
        Ok(())
    }
}
