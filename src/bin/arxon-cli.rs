use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use arxon_core::config::{load_config, AppConfig};
use arxon_core::observability::logging;
use arxon_core::AppContext;

#[derive(Parser)]
#[command(name = "arxon-cli")]
#[command(about = "Management CLI for the ARXON client core", long_about = None)]
struct Cli {
    /// Status API base URL.
    #[arg(short, long, default_value = "http://127.0.0.1:8787")]
    url: String,

    /// Bearer key for mutating status endpoints.
    #[arg(short, long)]
    key: Option<String>,

    /// Configuration used by `recover`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend circuit status
    Status,
    /// Close the circuit now instead of waiting for the cooldown
    Retry,
    /// Inspect one cache entry
    Cache { key: String },
    /// Remove cache entries whose key starts with PREFIX (all when omitted)
    CacheClear { prefix: Option<String> },
    /// Resolve a password-recovery link against the configured backend
    Recover { link: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    if let Some(key) = &cli.key {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", key))?);
    }

    match cli.command {
        Commands::Status => {
            let res = client.get(format!("{}/status", cli.url)).send().await?;
            print_response(res).await?;
        }
        Commands::Retry => {
            let res = client
                .post(format!("{}/status/retry", cli.url))
                .headers(headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Cache { key } => {
            let res = client.get(format!("{}/cache/{}", cli.url, key)).send().await?;
            print_response(res).await?;
        }
        Commands::CacheClear { prefix } => {
            let res = client
                .delete(format!("{}/cache", cli.url))
                .query(&[("prefix", prefix.unwrap_or_default())])
                .headers(headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Recover { link } => {
            let config = match &cli.config {
                Some(path) => load_config(path)?,
                None => AppConfig::default(),
            };
            logging::init_logging(&config.observability);
            recover(config, &link).await?;
        }
    }

    Ok(())
}

async fn recover(config: AppConfig, link: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = url::Url::parse(link)?;
    let context = Arc::new(AppContext::from_config(config)?);
    let handle = context.recovery_resolver().spawn(url);

    let outcome = tokio::select! {
        outcome = handle.finished() => outcome,
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(outcome) => {
            let report = serde_json::json!({
                "phase": format!("{:?}", outcome.phase),
                "path": outcome.path.as_str(),
                "canonical_url": outcome.canonical_url.map(String::from),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        None => eprintln!("Recovery cancelled"),
    }
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: status API returned {}", status);
        if let Ok(text) = res.text().await {
            if !text.is_empty() {
                eprintln!("Response: {}", text);
            }
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
