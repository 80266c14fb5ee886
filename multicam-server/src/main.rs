//! multicam-server: runs the control hub for a fixed set of PTZ cameras.
//!
//! Reads `multicam.toml`, connects every camera over VISCA/UDP, starts the
//! tally feeds and serves control panels over WebSocket until Ctrl-C.

use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use multicam_hub::config::CONFIG_FILE_NAME;
use multicam_hub::{
    CameraSpec, ConfigError, DeviceLink, HubConfig, HubServer, MemoryPresetStore, PresetStore,
    RocksPresetStore, SyncHub, TallyFeed, UdpVisca,
};

#[derive(Parser, Debug)]
#[command(name = "multicam-server")]
#[command(about = "Control hub for multi-camera productions", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Override the listen address from the configuration
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = HubConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    info!(
        "Loaded {} with {} camera(s)",
        args.config.display(),
        config.cameras.len()
    );

    let store: Arc<dyn PresetStore> = match config.storage.store_config() {
        Some(store_config) => {
            info!("Opening preset store at {}", store_config.path.display());
            Arc::new(RocksPresetStore::open(store_config)?)
        }
        None => {
            warn!("No storage path configured; presets will not survive a restart");
            Arc::new(MemoryPresetStore::new())
        }
    };

    let policy = config.device.retry_policy();
    let mut cameras = Vec::with_capacity(config.cameras.len());
    for (camera, cam) in config.cameras.iter().enumerate() {
        let addr = cam
            .socket_addr(config.device.visca_port)
            .ok_or_else(|| ConfigError::InvalidAddress {
                camera,
                address: cam.address.clone(),
            })?;
        let visca = UdpVisca::connect(addr).await?;
        info!("Camera {camera} at {addr}");
        cameras.push(CameraSpec {
            address: cam.address.clone(),
            link: DeviceLink::spawn(camera, visca, policy),
        });
    }

    let hub = SyncHub::new(cameras, store, config.hub.clone());

    let mut feeds = Vec::new();
    if let Some(tally) = &config.tally {
        for (camera, cam) in config.cameras.iter().enumerate() {
            let Some(tally_id) = cam.tally_id else {
                continue;
            };
            let sink = hub.tally_sink();
            let feed = TallyFeed::new(camera, tally_id, tally.source(), tally.backoff());
            feeds.push(feed.spawn(move |update| sink.notify(update)));
        }
        info!("Started {} tally feed(s) from {}", feeds.len(), tally.source());
    }

    let server = HubServer::new(config.server.clone(), hub);
    let result = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    for feed in feeds {
        feed.abort();
    }
    result?;
    info!("Hub stopped");
    Ok(())
}
