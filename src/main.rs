use std::{error::Error, process::exit};

use args::{ClientArguments, HostArguments, StartupArguments, StartupMode};
use clap::Parser;
use relay_tunnel::{client::ClientSession, error::RelayError, host::HostSession, logging};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod args;

fn main() {
    let arguments = StartupArguments::parse();
    logging::init_tracing(arguments.log_level.as_deref());
    info!("{}", args::get_version_string());

    let runtime_result = tokio::runtime::Builder::new_multi_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => runtime.block_on(async_main(arguments.mode)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        error!("Program finished with error: {error}");
        exit(1);
    }
}

async fn async_main(mode: StartupMode) -> Result<(), Box<dyn Error>> {
    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();

    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("Shutdown signal received");
        shutdown_signal.cancel();
    });

    match mode {
        StartupMode::Host(args) => run_host(args, shutdown).await,
        StartupMode::Client(args) => run_client(args, shutdown).await,
    }
}

async fn run_host(args: HostArguments, shutdown: CancellationToken) -> Result<(), Box<dyn Error>> {
    let host = HostSession::new(args.endpoint(), args.config());
    info!(ports = ?host.ports(), "Connecting to relay as host");

    tokio::select! {
        result = host.connect() => result?,
        _ = shutdown.cancelled() => return Ok(()),
    }

    info!("Host session established");
    tokio::select! {
        _ = shutdown.cancelled() => host.close(),
        _ = host.closed() => {}
    }

    finish(host.close_reason())
}

async fn run_client(args: ClientArguments, shutdown: CancellationToken) -> Result<(), Box<dyn Error>> {
    let client = ClientSession::new(args.endpoint(), args.config());
    info!("Connecting to relay as client");

    tokio::select! {
        result = client.connect() => result?,
        _ = shutdown.cancelled() => return Ok(()),
    }

    info!("Client session established");
    for &port in &args.wait_for {
        match client.wait_for_forwarded_port(port, &shutdown, args.wait_timeout()).await {
            Ok(()) => match client.local_forwarder_addresses(port) {
                Some(addresses) => info!(port, ?addresses, "Port ready"),
                None => info!(port, "Port forwarded"),
            },
            Err(RelayError::Cancelled) => {
                client.close();
                return Ok(());
            }
            Err(RelayError::Timeout) => {
                client.close();
                return Err(format!("port {port} was not forwarded in time").into());
            }
            Err(error) => return Err(error.into()),
        }
    }

    tokio::select! {
        _ = shutdown.cancelled() => client.close(),
        _ = client.closed() => {}
    }

    finish(client.close_reason())
}

fn finish(close_reason: Option<String>) -> Result<(), Box<dyn Error>> {
    match close_reason {
        Some(reason) => Err(format!("session closed with error: {reason}").into()),
        None => {
            info!("Session closed");
            Ok(())
        }
    }
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("Failed to listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
