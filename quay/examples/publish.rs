//! Publish a handful of messages, one at a time and as a batch.
//!
//! Run this example:
//! ```bash
//! RUST_LOG=debug cargo run --example publish -- 127.0.0.1:4150 events
//! ```

use quay::nsq::prelude::*;
use std::env;
use std::time::Duration;
use tracing::info;

#[compio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    quay::dev_tracing::init_tracing();

    let mut args = env::args().skip(1);
    let address = Address::parse(&args.next().unwrap_or_else(|| "127.0.0.1:4150".into()))?;
    let topic = args.next().unwrap_or_else(|| "events".into());

    let config = ConnectionConfig::default()
        .with_identify(IdentifyOptions::default().with_client_id("quay-publish"));
    let mut producer = Producer::connect(&address, &config).await?;

    for i in 0..5 {
        producer.publish(&topic, format!("single {i}")).await?;
    }
    let batch = (0..5).map(|i| Bytes::from(format!("batch {i}"))).collect();
    producer.multi_publish(&topic, batch).await?;
    producer
        .deferred_publish(&topic, Duration::from_secs(2), "deferred")
        .await?;
    info!("published 11 messages to {}", topic);

    producer.close().await;
    Ok(())
}
