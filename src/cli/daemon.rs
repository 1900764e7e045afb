// CLI daemon commands: start, stop, status

use std::path::Path;

use reqwest::Client;
use serde_json::Value;

use super::{base_url, handle_request_error};

/// rdl start
pub async fn cmd_start(
    host: &str,
    config: Option<&str>,
    port_override: Option<u16>,
    data_dir: Option<&str>,
) -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();

    // Only a non-default --host overrides the configured bind address
    let host_override = if host != "127.0.0.1" {
        Some(host)
    } else {
        None
    };

    crate::daemon::start_daemon(
        config.map(Path::new),
        data_dir.map(Path::new),
        host_override,
        port_override,
    )
    .await
}

/// rdl stop
pub async fn cmd_stop(host: &str, port: u16) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/shutdown", base_url(host, port));

    let response = client
        .post(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("Unknown error");
        anyhow::bail!("{}", message);
    }

    println!("Daemon is shutting down...");
    Ok(())
}

/// rdl status
pub async fn cmd_status(host: &str, port: u16, verbose: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/health", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if !status.is_success() {
        let message = body["message"]
            .as_str()
            .unwrap_or("Daemon returned an error");
        anyhow::bail!("{}", message);
    }

    let daemon_status = body["status"].as_str().unwrap_or("unknown");
    let version = body["version"].as_str().unwrap_or("unknown");
    let uptime = body["uptime_seconds"].as_u64().unwrap_or(0);
    let active = body["active_fetches"].as_u64().unwrap_or(0);
    let total = body["total_jobs"].as_u64().unwrap_or(0);
    let data_dir = body["data_dir"].as_str().unwrap_or("unknown");
    let jobs = &body["jobs"];

    println!("Daemon Status: {}", daemon_status);
    println!("  Data Dir:    {}", data_dir);
    println!("  API:         http://{}:{}/resourceDownloader", host, port);
    println!("  Fetches:     {} active / {} jobs total", active, total);
    println!(
        "  Jobs:        {} pending, {} in progress, {} succeeded, {} failed",
        jobs["pending"].as_u64().unwrap_or(0),
        jobs["in_progress"].as_u64().unwrap_or(0),
        jobs["succeeded"].as_u64().unwrap_or(0),
        jobs["failed"].as_u64().unwrap_or(0),
    );
    println!("  Uptime:      {}", format_uptime(uptime));
    println!("  Version:     {}", version);

    if verbose {
        println!("\nRaw response:");
        println!("{}", serde_json::to_string_pretty(&body)?);
    }

    Ok(())
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
