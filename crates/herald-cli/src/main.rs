//! Herald CLI - publish records from the command line
//!
//! `herald produce-order` publishes a single JSON order event and logs its
//! delivery report; `herald produce` publishes an arbitrary message.

mod config;
mod order;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use config::CliConfig;
use herald_client::{JsonSerializer, Producer};
use order::{delivery_report, Order};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Herald - asynchronous, ordered, at-least-once publisher")]
#[command(version)]
struct Cli {
    /// Bootstrap servers, comma separated (overrides the config file)
    #[arg(short, long, env = "HERALD_BOOTSTRAP", global = true)]
    bootstrap: Option<String>,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one order event
    ProduceOrder {
        /// Ordering user
        #[arg(long, default_value = "user02")]
        user: String,

        /// Ordered item
        #[arg(long, default_value = "chicken bowl")]
        item: String,

        /// Quantity
        #[arg(long, default_value = "1")]
        quantity: u32,

        /// Destination topic
        #[arg(short, long, default_value = "orders")]
        topic: String,

        /// Use the user as the record key
        #[arg(long)]
        key_by_user: bool,
    },

    /// Publish a message to a topic
    Produce {
        /// Topic name
        topic: String,

        /// Message to publish
        message: String,

        /// Partition (optional, chosen from the key or round-robin if not specified)
        #[arg(short, long)]
        partition: Option<u32>,

        /// Message key (optional)
        #[arg(short, long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CliConfig::from_file(path)?,
        None => CliConfig::default(),
    };
    if let Some(bootstrap) = &cli.bootstrap {
        config.producer.bootstrap_servers = bootstrap
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let producer = Producer::new(config.producer.clone()).await?;

    let published = match cli.command {
        Commands::ProduceOrder {
            user,
            item,
            quantity,
            topic,
            key_by_user,
        } => {
            let order = Order::new(user, item, quantity);
            let serializer = if key_by_user {
                JsonSerializer::new().with_key(|o: &Order| Some(Bytes::from(o.user.clone())))
            } else {
                JsonSerializer::new()
            };
            info!("Publishing order {} to '{}'", order.order_id, topic);
            producer
                .publish_serialized(topic, &order, &serializer, delivery_report)
                .await
        }
        Commands::Produce {
            topic,
            message,
            partition,
            key,
        } => {
            let key = key.map(Bytes::from);
            match partition {
                Some(partition) => {
                    producer
                        .publish_to_partition(topic, partition, key, message, delivery_report)
                        .await
                }
                None => producer.publish(topic, key, message, delivery_report).await,
            }
        }
    };

    let flushed = match published {
        Ok(_) => producer.flush().await.context("Flush failed"),
        Err(e) => Err(anyhow::Error::new(e).context("Publish failed")),
    };

    producer.close(config.close_timeout()).await;
    flushed
}
