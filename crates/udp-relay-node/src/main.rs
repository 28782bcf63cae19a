// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use udp_relay::config::{RelayConfig, ENV_DEBUG, ENV_LOG_LEVEL};
use udp_relay::relay::Relay;

/// Listens for UDP datagrams and forwards them in batches to Azure Event Hubs.
#[derive(Parser, Debug)]
#[command(name = "udp-relay-node")]
struct Args {
    /// UDP port to listen on [default: RELAY_PORT or 1444]
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();

    let debug_enabled = env::var(ENV_DEBUG)
        .map(|val| val.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let log_level = if debug_enabled {
        "debug".to_string()
    } else {
        env::var(ENV_LOG_LEVEL)
            .map(|val| val.to_lowercase())
            .unwrap_or("warn".to_string())
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let mut config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error reading relay configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = args.port {
        config.port = port;
        if let Err(e) = config.validate() {
            error!("Error reading relay configuration: {e}");
            return ExitCode::FAILURE;
        }
    }

    let relay = match Relay::new(&config).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("Error starting relay: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "udp-relay: listening on {}:{}, batching on the {} side",
        config.host, config.port, config.batching
    );

    let handle = relay.start();
    tokio::spawn(cancel_on_signal(handle.cancel_token()));

    match handle.wait().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Relay stopped with an error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cancel_on_signal(cancel_token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
        () = cancel_token.cancelled() => return,
    }
    info!("Shutdown signal received, draining pending batches");
    cancel_token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_port_is_the_only_flag() {
        let args = Args::try_parse_from(["udp-relay-node", "--port", "9000"]).unwrap();
        assert_eq!(args.port, Some(9000));

        let args = Args::try_parse_from(["udp-relay-node"]).unwrap();
        assert_eq!(args.port, None);

        for flag in ["--version", "-V"] {
            let err = Args::try_parse_from(["udp-relay-node", flag]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnknownArgument, "{flag}");
        }
    }
}
