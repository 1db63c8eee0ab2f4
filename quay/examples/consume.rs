//! Consume a topic and print each message.
//!
//! Run this example:
//! ```bash
//! RUST_LOG=info cargo run --example consume -- 127.0.0.1:4150 events archive
//! ```

use quay::nsq::prelude::*;
use quay::nsq::ReaderStats;
use std::env;
use std::time::Duration;
use tracing::info;

struct Print;

#[async_trait(?Send)]
impl Handler for Print {
    async fn handle(&self, message: &Message) -> Outcome {
        info!(
            "{} attempt={} {}",
            message.id,
            message.attempts,
            String::from_utf8_lossy(&message.body)
        );
        Outcome::Completed
    }
}

#[compio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    quay::dev_tracing::init_tracing();

    let mut args = env::args().skip(1);
    let address = Address::parse(&args.next().unwrap_or_else(|| "127.0.0.1:4150".into()))?;
    let topic = args.next().unwrap_or_else(|| "events".into());
    let channel = args.next().unwrap_or_else(|| "quay-demo".into());

    let reader = Reader::start(
        [address],
        &topic,
        &channel,
        Print,
        ReaderConfig::default().with_max_in_flight(10),
    )?;

    for _ in 0..6 {
        compio::time::sleep(Duration::from_secs(5)).await;
        let ReaderStats {
            connections,
            received,
            finished,
            ..
        } = reader.stats();
        info!("connections={} received={} finished={}", connections, received, finished);
    }

    reader.close().await?;
    Ok(())
}
