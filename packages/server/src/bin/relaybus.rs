//! `RelayBus` demo node.
//!
//! Boots a bus with a loopback `echo` endpoint fronted by the `echo-proxy`
//! proxy service, sends one request through it, and runs until Ctrl+C or
//! SIGTERM, then drains and shuts down.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relaybus_core::{properties, Message};
use relaybus_server::mediation::{LogLevel, LogMediator, PropertyMediator};
use relaybus_server::{BusConfig, BusContext, MediationSequence, ProxyService, ServiceEndpoint};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relaybus")]
#[command(about = "RelayBus mediation node")]
struct Args {
    /// JSON configuration file; defaults apply to missing fields
    #[arg(long, env = "RELAYBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, env = "RELAYBUS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "RELAYBUS_JSON_LOGS", default_value = "false")]
    json_logs: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "RELAYBUS_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let config = match &args.config {
        Some(path) => BusConfig::from_json_file(path)?,
        None => BusConfig::default(),
    };
    let bus = BusContext::new(config)?;
    register_demo_services(&bus);

    bus.start().await?;
    info!("RelayBus started. Press Ctrl+C to shut down.");

    let request = Message::new("hello from relaybus").with_property(properties::CLIENT_ID, "demo");
    match bus.process("echo-proxy", request).await {
        Ok(reply) => info!(
            message_id = %reply.id,
            payload = %reply.payload_text(),
            "demo request answered"
        ),
        Err(error) => warn!(error = %error.chain(), "demo request failed"),
    }

    shutdown_signal().await;
    info!("shutdown signal received");
    bus.shutdown().await?;
    info!("RelayBus shutdown complete");
    Ok(())
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn register_demo_services(bus: &BusContext) {
    let registry = bus.registry();
    registry.register_endpoint(Arc::new(ServiceEndpoint::echo("echo")));
    registry.register_sequence(
        MediationSequence::new("inbound")
            .as_in_sequence()
            .mediator(Arc::new(
                LogMediator::new("log-inbound", LogLevel::Info).property(properties::CLIENT_ID),
            ))
            .mediator(Arc::new(PropertyMediator::set("mark-routed", "routed_by", "relaybus"))),
    );
    registry.register_proxy(
        ProxyService::new("echo-proxy")
            .target("echo")
            .in_sequence("inbound")
            .response_cache("echo-responses"),
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
