//! Push streams over one multiplexer.
//!
//! Demonstrates:
//! - Providing a multiplexer (opens a session as needed)
//! - Subscribing several streams on one socket
//! - Reading pushed packets
//! - Unsubscribing everything
//!
//! Usage:
//!   XAPI_USER=1000 XAPI_PASSWORD=secret cargo run --example 002_stream
//!   XAPI_USER=1000 XAPI_PASSWORD=secret cargo run --example 002_stream -- --debug

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use common::Args;
use serde_json::json;
use tokio::time::timeout;
use xapi_link::{HandlerPool, Result};

// ============================================================================
// Constants
// ============================================================================

const PACKET_LIMIT: usize = 20;

const READ_WINDOW: Duration = Duration::from_secs(30);

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    common::init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    println!("=== 002: Streams ===\n");

    // ========================================================================
    // Create Multiplexer
    // ========================================================================

    println!("[1] Creating pool and multiplexer...");
    let pool = HandlerPool::new(common::config(&args)?)?;
    let mux = pool.provide_multiplexer().await?;

    println!("    ✓ {} on {}", mux.name(), mux.session().name());
    println!(
        "    Subscriptions: {}/{}\n",
        mux.subscription_count(),
        mux.max_subscriptions()
    );

    // ========================================================================
    // Subscribe
    // ========================================================================

    println!("[2] Subscribing...");
    let mut packets = match mux.take_packets() {
        Some(packets) => packets,
        None => return Err(xapi_link::Error::protocol("packet receiver already taken")),
    };

    mux.subscribe("Balance", None).await?;
    println!("    ✓ Balance");

    let arguments = json!({"symbol": "EURUSD", "minArrivalTime": 1000, "maxLevel": 0});
    mux.subscribe("TickPrices", arguments.as_object().cloned())
        .await?;
    println!("    ✓ TickPrices EURUSD\n");

    // ========================================================================
    // Read
    // ========================================================================

    println!("[3] Reading up to {PACKET_LIMIT} packets...");
    let mut received = 0;
    while received < PACKET_LIMIT {
        match timeout(READ_WINDOW, packets.recv()).await {
            Ok(Some(packet)) => {
                received += 1;
                let command = packet.command.as_deref().unwrap_or("?");
                println!("    [{received:02}] {command}: {}", packet.data);
            }
            Ok(None) => {
                println!("    ✗ Stream ended");
                break;
            }
            Err(_) => {
                println!("    - Nothing within {READ_WINDOW:?}");
                break;
            }
        }
    }
    println!();

    // ========================================================================
    // Cleanup
    // ========================================================================

    println!("[Cleanup] Ending streams...");
    mux.end_stream().await;
    pool.delete().await;
    println!("          ✓ Done");

    Ok(())
}
