//! Murmur CLI tools: identity keys and a local messaging demo.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use murmur_common::{InboundMessage, UserId, WireEnvelope};
use murmur_crypto::IdentityKeypair;
use murmur_e2ee::{
    AutoAcknowledge, E2eeClient, E2eeConfig, InMemoryKeyDirectory, Inbound, KeyDirectory,
    MemoryStorage,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(about = "Murmur CLI tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new device identity keypair
    Keygen {
        /// Output file path
        #[arg(short, long, default_value = "murmur.key")]
        output: PathBuf,
    },

    /// Show the device key of an identity file
    ShowId {
        /// Identity file path
        #[arg(short, long)]
        key: PathBuf,
    },

    /// Run a local conversation between simulated devices
    Demo {
        /// Message alice sends to bob
        #[arg(short, long, default_value = "hello bob")]
        message: String,

        /// Engine configuration (JSON)
        #[arg(short, long, env = "MURMUR_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    murmur_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Keygen { output } => {
            println!("Generating device identity...");

            let keypair = IdentityKeypair::generate();
            keypair.save(&output)?;

            println!("Identity:   {}", output.display());
            println!("Device key: {}", keypair.device_key());
        }
        Command::ShowId { key } => {
            let keypair = IdentityKeypair::load(&key)?;
            println!("{}", keypair.device_key());
        }
        Command::Demo { message, config } => {
            let config = match config {
                Some(path) => E2eeConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => E2eeConfig::default(),
            };

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(demo(message, config))?;
        }
        Command::Version => {
            println!("murmur {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

struct DemoDevice {
    name: &'static str,
    client: E2eeClient,
}

async fn demo_device(
    name: &'static str,
    user: &str,
    directory: &Arc<InMemoryKeyDirectory>,
    config: &E2eeConfig,
) -> Result<DemoDevice> {
    let client = E2eeClient::new(
        UserId::from(user),
        Arc::new(MemoryStorage::new()),
        directory.clone(),
        config.clone(),
    )?;
    let key = client.initialize(&AutoAcknowledge).await?;
    println!("{name:<14} {key}");
    Ok(DemoDevice { name, client })
}

async fn deliver(from: &DemoDevice, envelope: &WireEnvelope, to: &[&DemoDevice]) -> Result<()> {
    let inbound = InboundMessage {
        message_id: Uuid::new_v4(),
        sender_user: from.client.user().clone(),
        envelope: envelope.clone(),
    };
    for device in to {
        match device.client.handle_incoming(&inbound).await? {
            result @ (Inbound::Plaintext(_) | Inbound::Recovered { .. }) => {
                for message in result.into_messages() {
                    println!(
                        "  {:<12} <- {}",
                        device.name,
                        String::from_utf8_lossy(&message.plaintext)
                    );
                }
            }
            other => println!("  {:<12} {other:?}", device.name),
        }
    }
    Ok(())
}

async fn demo(message: String, config: E2eeConfig) -> Result<()> {
    let directory = Arc::new(InMemoryKeyDirectory::new(config.low_watermark));

    println!("Registering devices...");
    let alice_phone = demo_device("alice/phone", "alice", &directory, &config).await?;
    let alice_laptop = demo_device("alice/laptop", "alice", &directory, &config).await?;
    let bob_phone = demo_device("bob/phone", "bob", &directory, &config).await?;
    let monitor = bob_phone.client.spawn_prekey_monitor();

    let bob = bob_phone.client.user().clone();
    let alice = alice_phone.client.user().clone();
    let everyone = [&alice_phone, &alice_laptop, &bob_phone];

    println!("\nalice/phone -> bob: {message:?}");
    let report = alice_phone
        .client
        .send_encrypted(message.as_bytes(), std::slice::from_ref(&bob))
        .await?;
    info!(
        devices = report.envelope.len(),
        skipped = report.skipped.len(),
        "envelope built"
    );
    deliver(&alice_phone, &report.envelope, &everyone).await?;

    println!("\nbob/phone -> alice: \"hi alice\"");
    let reply = bob_phone
        .client
        .send_encrypted(b"hi alice", std::slice::from_ref(&alice))
        .await?;
    deliver(&bob_phone, &reply.envelope, &everyone).await?;

    let bob_key = bob_phone.client.device_key().await?;
    println!(
        "\nbob/phone one-time prekeys published: {}",
        directory.prekey_count(&bob, &bob_key).await?
    );

    monitor.shutdown().await;
    Ok(())
}
