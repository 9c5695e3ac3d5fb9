//! Session login and data requests.
//!
//! Demonstrates:
//! - Building a configuration from the environment
//! - Providing a session from the pool
//! - Issuing `get<Command>` requests
//! - Handling server rejections
//!
//! Usage:
//!   XAPI_USER=1000 XAPI_PASSWORD=secret cargo run --example 001_fetch_data
//!   XAPI_USER=1000 XAPI_PASSWORD=secret cargo run --example 001_fetch_data -- --debug

mod common;

// ============================================================================
// Imports
// ============================================================================

use common::Args;
use serde_json::json;
use xapi_link::{Error, HandlerPool, Result};

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
    println!("=== 001: Fetch Data ===\n");

    // ========================================================================
    // Create Pool
    // ========================================================================

    println!("[1] Creating pool...");
    let config = common::config(&args)?;
    println!("    Host:    {}", config.host);
    println!("    Account: {:?}", config.account);

    let pool = HandlerPool::new(config)?;
    println!("    ✓ Pool ready\n");

    // ========================================================================
    // Login
    // ========================================================================

    println!("[2] Logging in...");
    let session = pool.provide_session().await?;
    println!("    ✓ Session {} active\n", session.name());

    // ========================================================================
    // Requests
    // ========================================================================

    println!("[3] Fetching data...");
    let version = session.fetch_data("Version", None).await?;
    println!("    Version:    {version}");

    let server_time = session.fetch_data("ServerTime", None).await?;
    println!("    ServerTime: {server_time}");

    let arguments = json!({"symbol": "EURUSD"});
    let symbol = session
        .fetch_data("Symbol", arguments.as_object().cloned())
        .await?;
    println!("    EURUSD ask: {}\n", symbol["ask"]);

    // ========================================================================
    // Rejection
    // ========================================================================

    println!("[4] Requesting an unknown symbol...");
    let arguments = json!({"symbol": "NOT-A-SYMBOL"});
    match session
        .fetch_data("Symbol", arguments.as_object().cloned())
        .await
    {
        Err(Error::Server { code, description }) => {
            println!("    ✓ Rejected: {code} {description}");
        }
        Err(e) => return Err(e),
        Ok(data) => println!("    ✗ Unexpected data: {data}"),
    }
    println!("    Session still {:?}\n", session.status());

    // ========================================================================
    // Cleanup
    // ========================================================================

    println!("[Cleanup] Deleting pool...");
    pool.delete().await;
    println!("          ✓ Done");

    Ok(())
}
