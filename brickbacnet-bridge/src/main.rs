//! BACnet metadata and ingestion gateway.
//!
//! Discovers devices and objects into the metadata store, polls present
//! values into a timeseries sink and writes points by UUID.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use brickbacnet_bridge::Gateway;
use brickbacnet_bridge::actuation::PointWrite;
use brickbacnet_bridge::codec::TypeCode;
use brickbacnet_bridge::config::GatewayConfig;
use brickbacnet_bridge::object::PropertyId;
use brickbacnet_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};

const DEFAULT_CONFIG: &str = "brickbacnet.json5";

/// BACnet gateway: discovery, metadata caching and present-value polling.
#[derive(Parser, Debug)]
#[command(name = "brickbacnet-bridge")]
#[command(about = "Discovers BACnet devices and forwards their readings to a timeseries backend")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: BridgeArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover devices and objects into the metadata store.
    Discover,
    /// Poll configured devices until stopped.
    Poll,
    /// Discover, then poll.
    Run,
    /// Write a property of the point with the given UUID.
    Write {
        uuid: Uuid,
        value: String,
        /// Property name (default: presentValue)
        #[arg(short, long, default_value = "presentValue")]
        property: PropertyId,
        /// Array index
        #[arg(short, long)]
        index: Option<u32>,
        /// Command priority (1-16)
        #[arg(long)]
        priority: Option<u8>,
        /// Wire type for any-atomic properties: b, u, i, r, d, o, c, bs, date, time, id
        #[arg(short = 't', long = "type")]
        type_code: Option<TypeCode>,
    },
    /// Assign random UUIDs to points that have none.
    AssignUuids {
        /// Device id (default: every stored device)
        device: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.common.config_path(DEFAULT_CONFIG);
    let config = GatewayConfig::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let mut runner = BridgeRunner::new_with_args("brickbacnet-bridge", config, Some(&cli.common))?;
    info!("Loaded configuration from {:?}", config_path);

    let gateway = Gateway::from_config(runner.config())
        .await
        .context("Failed to start gateway")?;
    let token = runner.token();

    match cli.command {
        Command::Discover => runner.spawn("discovery", async move {
            let devices = gateway.discover(&token).await?;
            info!("Discovery finished: {} device(s)", devices.len());
            Ok::<(), brickbacnet_bridge::Error>(())
        }),
        Command::Poll => runner.spawn("poller", async move { gateway.poll(token).await }),
        Command::Run => runner.spawn("gateway", async move { gateway.run(token).await }),
        Command::Write {
            uuid,
            value,
            property,
            index,
            priority,
            type_code,
        } => {
            let request = PointWrite {
                uuid,
                property,
                literal: value,
                index,
                priority,
                type_code,
            };
            runner.spawn("write", async move {
                let actuator = gateway.actuator();
                actuator.write(&request).await?;
                let value = actuator.read(request.uuid, request.property, request.index).await?;
                info!("{} {} is now {}", request.uuid, request.property, value);
                Ok::<(), brickbacnet_bridge::Error>(())
            });
        }
        Command::AssignUuids { device } => runner.spawn("assign-uuids", async move {
            let assigned = gateway.assign_uuids(device).await?;
            info!("Assigned {} UUID(s)", assigned);
            Ok::<(), brickbacnet_bridge::Error>(())
        }),
    }

    runner.run().await?;
    Ok(())
}
