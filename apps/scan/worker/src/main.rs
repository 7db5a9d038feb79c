//! Scan Worker Service - Entry Point
//!
//! Background worker that consumes scan requests from RabbitMQ.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    scan_worker::run().await
}
