// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use relsign::{
    config::load_config,
    server::{service::Server, Config, Secrets},
    signal_handler,
};
use tracing::Instrument;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

mod cli;

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "relsign/server.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = cli::Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "RELSIGN_SERVER_LOG contains an invalid log directive; refer to \
        https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
        filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let mut config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;

    match opts.command {
        cli::Command::Listen {
            credentials_directory,
        } => {
            if let Some(credentials) = config.credentials.as_mut() {
                credentials.with_credentials_dir(&credentials_directory)?;
            }
            let secrets = Secrets::load(&config, &credentials_directory)?;

            let root_span = tracing::info_span!("relsign");
            async move {
                let server = Server::new(config, secrets).await?;
                let server = server.run();
                tokio::spawn(signal_handler(server.halt_token()));

                server.wait_to_finish().await?;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(root_span)
            .await?;
        }
        cli::Command::Config {
            credentials_directory,
        } => {
            println!("# This is the current configuration\n\n{config}\n# This concludes the configuration.\n");
            if let Some(credentials_directory) = credentials_directory {
                let result = config
                    .credentials
                    .as_mut()
                    .map_or(Ok(()), |credentials| {
                        credentials.with_credentials_dir(&credentials_directory)
                    })
                    .and_then(|()| Secrets::load(&config, &credentials_directory).map(drop));
                _ = result.inspect_err(|error| {
                    eprintln!("The configuration format is valid, but the referenced credentials aren't valid: {error:?}");
                });
            }
        }
    };

    Ok(())
}
