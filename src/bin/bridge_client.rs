//! Diagnostic client for the bridge
//!
//! Calls one method, the same way sandboxed code does, and prints the raw
//! response. Useful for checking a bridge from inside the sandbox network:
//!
//! ```text
//! bridge-client --addr civic-audit-bridge:8000 call list_datasets
//! bridge-client call run_query '{"query": "SELECT COUNT(*) AS n FROM despesas"}'
//! bridge-client verify
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use civic_audit::bridge::{BridgeClient, Method};

#[derive(Parser)]
#[command(name = "bridge-client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Call the civic-audit bridge and print the response", long_about = None)]
struct Cli {
    /// Bridge address
    #[arg(short, long, env = "BRIDGE_ADDR", default_value = "127.0.0.1:8000")]
    addr: String,

    /// Seconds to wait for each response
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Call any method; params are a JSON object
    Call {
        method: String,
        params: Option<String>,
    },

    /// List datasets, then describe the first one
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = BridgeClient::new(cli.addr.clone()).with_timeout(Duration::from_secs(cli.timeout));

    match cli.command {
        Command::Call { method, params } => {
            let params = params
                .map(|p| serde_json::from_str::<Value>(&p))
                .transpose()
                .context("params must be a JSON object")?;
            let result = client.call(&method, params).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Verify => verify(&client).await?,
    }
    Ok(())
}

async fn verify(client: &BridgeClient) -> Result<()> {
    println!("bridge: {}", client.addr());

    let datasets = client
        .call(Method::LIST_DATASETS, None)
        .await
        .context("list_datasets failed")?;
    let names: Vec<String> = serde_json::from_value(datasets)?;
    println!("  ✓ list_datasets: {} dataset(s)", names.len());

    let Some(first) = names.first() else {
        println!("  ! no datasets to describe");
        return Ok(());
    };

    let ddl = client
        .call(Method::DESCRIBE_DATASET, Some(serde_json::json!({ "name": first })))
        .await
        .with_context(|| format!("describe_dataset {} failed", first))?;
    println!("  ✓ describe_dataset {}:\n{}", first, ddl.as_str().unwrap_or_default());
    Ok(())
}
