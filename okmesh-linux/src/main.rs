// okmesh Linux daemon: spool-backed message store, UDP/relay, BLE, LAN discovery, sync loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use okmesh_core::IncomingPacketPipeline;
use okmesh_linux::ble::{BleRadio, BleTransport};
use okmesh_linux::coordinator::TransportCoordinator;
use okmesh_linux::discovery::{LocalDiscoveryController, MulticastSession};
use okmesh_linux::config;
use okmesh_linux::spool::{LogNotifier, SpoolContacts, SpoolCore};
use okmesh_linux::udp::UdpTransport;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut enqueue: Vec<PathBuf> = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("okmesh-linux {}", VERSION);
                return Ok(());
            }
            // Queue a packet file in the spool outbox and exit.
            "--enqueue" => {
                let path = args.next().context("--enqueue needs a packet file")?;
                enqueue.push(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load().context("loading configuration")?;
    std::fs::create_dir_all(&cfg.spool_dir)
        .with_context(|| format!("creating spool dir {}", cfg.spool_dir.display()))?;
    let core = Arc::new(SpoolCore::open(&cfg.spool_dir).context("opening spool")?);
    if !enqueue.is_empty() {
        for path in &enqueue {
            let packet = std::fs::read(path)
                .with_context(|| format!("reading packet {}", path.display()))?;
            let id = core.enqueue(&packet).context("writing to outbox")?;
            info!(%id, file = %path.display(), "packet queued");
            println!("{id}");
        }
        return Ok(());
    }
    let contacts = Arc::new(SpoolContacts::open(&cfg.spool_dir).context("opening contacts")?);
    let security = cfg.relay_security()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let udp = Arc::new(UdpTransport::new(cfg.udp(), security, inbound_tx.clone()));
        let ble = Arc::new(BleTransport::new(radio(), cfg.ble(), inbound_tx));
        let pipeline = Arc::new(IncomingPacketPipeline::new(
            core.clone(),
            contacts,
            Arc::new(LogNotifier),
        ));

        let mut coordinator = TransportCoordinator::new(core, pipeline, inbound_rx, cfg.sync())
            .with_transport(udp.clone())
            .with_transport(ble);
        if cfg.discovery_enabled {
            let session = Arc::new(MulticastSession::new(cfg.discovery_port));
            coordinator =
                coordinator.with_discovery(Arc::new(LocalDiscoveryController::new(session, udp)));
        }
        let coordinator = Arc::new(coordinator);

        info!(version = VERSION, spool = %cfg.spool_dir.display(), "okmesh starting");
        coordinator.start().await;
        shutdown_signal().await?;
        info!("shutting down");
        coordinator.stop().await;
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(feature = "bluetooth")]
fn radio() -> Arc<dyn BleRadio> {
    Arc::new(okmesh_linux::bluez::BluezRadio::new())
}

#[cfg(not(feature = "bluetooth"))]
fn radio() -> Arc<dyn BleRadio> {
    Arc::new(okmesh_linux::ble::UnavailableRadio)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
