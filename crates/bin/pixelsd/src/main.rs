//! # pixelsd — Pixels dice daemon
//!
//! Composition root that wires a transport to one session per configured die.
//!
//! ## Responsibilities
//! - Load configuration (`pixels.toml`, env overrides)
//! - Initialise `tracing`
//! - Construct the transport: btleplug, or simulated dice when
//!   `integrations.virtual_enabled` is set
//! - Register one session per `[[dice]]` entry and log its state changes
//! - Apply the autoconnect policy
//! - Shut every session down on Ctrl-C
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It only wires crates together; no domain logic belongs here.

mod config;
mod host;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use pixels_dice_adapter_ble::BleTransport;
use pixels_dice_adapter_virtual::VirtualTransport;
use pixels_dice_app::ports::Transport;
use pixels_dice_domain::die::DieConfig;

use crate::config::Config;
use crate::host::Host;

/// Die registered in virtual mode when the config lists none.
const DEMO_DIE_NAME: &str = "Virtual Die";

/// Interval between simulated advertisements and rolls.
const DEMO_PERIOD: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config.logging.filter);

    let dice = config.die_configs()?;

    if config.integrations.virtual_enabled {
        let dice = if dice.is_empty() {
            vec![DieConfig::named(DEMO_DIE_NAME)?.with_autoconnect(true)]
        } else {
            dice
        };
        let transport = Arc::new(VirtualTransport::new());
        for die in &dice {
            transport.add_die(&die.name);
        }
        tracing::info!(count = dice.len(), "virtual dice enabled");

        let demo = transport.spawn_demo(DEMO_PERIOD);
        run(Arc::clone(&transport), dice).await?;
        demo.abort();
    } else {
        let transport = Arc::new(BleTransport::start(config.ble.clone()).await?);
        run(Arc::clone(&transport), dice).await?;
        transport.stop().await;
    }

    Ok(())
}

fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|err| {
        eprintln!("invalid log filter {filter:?} ({err}), falling back to info");
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn run<T: Transport>(
    transport: Arc<T>,
    dice: Vec<DieConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    if dice.is_empty() {
        tracing::warn!("no dice configured, add a [[dice]] entry to pixels.toml");
    }

    let host = Host::start(transport, dice)?;
    tracing::info!(dice = host.registry().len(), "pixelsd started");

    let mut connects = host.autoconnect();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            Some(joined) = connects.join_next() => match joined {
                Ok((id, state)) => tracing::info!(die = %id, ?state, "autoconnect finished"),
                Err(err) => tracing::warn!(%err, "autoconnect task failed"),
            },
        }
    }

    tracing::info!("shutting down");
    connects.abort_all();
    host.shutdown().await;
    Ok(())
}
