//! Remote-control streaming agent binary: wires the platform's capture
//! source, encoders, device identity, and permission provider into a
//! [`rc_agent::session::SessionController`] and runs it to completion.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rc_agent::channel::real_channel_factory;
use rc_agent::device::{DeviceIdentity, FilesystemDeviceIdentity};
use rc_agent::permission::AutoGrantPermissionProvider;
use rc_agent::session::SessionController;
use rc_agent::{config, LoggingInputInjector};
use rc_buffer::FrameBuffer;
use rc_capture::source::PortalCaptureSource;
use rc_capture::CaptureCoordinator;
use rc_diagnostics::Diagnostics;
use rc_encode::gstreamer_enc::{EncoderBackend, PrimaryEncoder};
use rc_encode::jpeg_fallback::FallbackEncoder;
use rc_encode::EncoderParams;
use rc_gesture::{Display, Rotation};

/// Remote-control streaming agent.
///
/// Captures the local screen, encodes it, and streams it to a backend
/// over a reconnecting WebSocket session, relaying gesture input back
/// onto the local display.
#[derive(Parser, Debug)]
#[command(name = "rc-agent", version, about)]
struct Cli {
    /// Path to the agent's TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the configured backend WebSocket URL.
    #[arg(long)]
    backend_url: Option<String>,

    /// Override the host-derived device id (for running multiple test
    /// agents against the same machine).
    #[arg(long)]
    device_id: Option<String>,

    /// Log verbosity fallback when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(backend_url) = cli.backend_url {
        cfg.connection.backend_url = backend_url;
    }

    let identity = FilesystemDeviceIdentity::load(cfg.device.token_path.clone()).context("failed to load device identity")?;
    let device_id = cli.device_id.unwrap_or_else(|| identity.device_id().to_string());
    let device_token = identity.token();

    tracing::info!(device_id, "starting rc-agent");

    let diagnostics = Arc::new(Diagnostics::new());
    let buffer = Arc::new(FrameBuffer::new(cfg.buffer.capacity));

    let source = PortalCaptureSource::negotiate().await.context("failed to negotiate screen capture with the desktop portal")?;
    let primary_factory: Arc<dyn Fn() -> Box<dyn rc_encode::Encoder> + Send + Sync> =
        Arc::new(|| Box::new(PrimaryEncoder::new(EncoderBackend::Auto)));
    let fallback_factory: Arc<dyn Fn() -> Box<dyn rc_encode::Encoder> + Send + Sync> = Arc::new(|| Box::new(FallbackEncoder::new()));

    let primary_params = EncoderParams::primary_with(cfg.capture.fps, cfg.capture.bitrate_bps);

    let capture = Arc::new(CaptureCoordinator::new(
        Arc::new(source),
        Arc::clone(&buffer),
        Arc::clone(&diagnostics),
        primary_factory,
        fallback_factory,
        primary_params,
        EncoderParams::fallback(),
        cfg.capture.max_width,
        cfg.capture.max_height,
    ));

    let permission = Arc::new(AutoGrantPermissionProvider::new());
    let input_injector = Arc::new(LoggingInputInjector::default());

    let display = Display {
        width: f64::from(cfg.capture.max_width),
        height: f64::from(cfg.capture.max_height),
        rotation: Rotation::Deg0,
    };

    let controller = Arc::new(SessionController::new(
        device_id,
        device_token,
        cfg.connection.backend_url.clone(),
        real_channel_factory(),
        capture,
        permission,
        input_injector,
        diagnostics,
        buffer,
        display,
        std::time::Duration::from_secs(cfg.connection.heartbeat_secs),
        cfg.connection.backoff_initial_ms,
        cfg.connection.backoff_max_ms,
    ));

    let shutdown_controller = Arc::clone(&controller);
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }

        shutdown_controller.request_shutdown();
    });

    controller.run().await;
    Ok(())
}
