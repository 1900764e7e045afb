// CLI job commands: submit, get, list, delete

use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde_json::Value;

use super::{base_url, handle_request_error};

/// Format a relative time string like "2 minutes ago".
fn format_relative_time(dt: &DateTime<Utc>) -> String {
    let secs = Utc::now().signed_duration_since(*dt).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86400)
    }
}

fn relative_field(job: &Value, field: &str) -> String {
    job[field]
        .as_str()
        .and_then(|ts| ts.parse::<DateTime<Utc>>().ok())
        .map(|dt| format_relative_time(&dt))
        .unwrap_or_else(|| "-".to_string())
}

/// Read the body and turn a non-success status into an error carrying the
/// daemon's message.
async fn read_json(response: Response) -> anyhow::Result<Value> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("Unknown error");
        anyhow::bail!("{} ({})", message, status.as_u16());
    }
    Ok(body)
}

/// rdl submit
pub async fn cmd_submit(host: &str, port: u16, url: &str, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let endpoint = format!("{}/resourceDownloader", base_url(host, port));

    let response = client
        .post(&endpoint)
        .json(&serde_json::json!({ "source_url": url }))
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let body = read_json(response).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let message = body["message"].as_str().unwrap_or("Submitted");
        println!("{}", message);
    }
    Ok(())
}

/// rdl get
pub async fn cmd_get(host: &str, port: u16, id: u64, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/resourceDownloader/{}", base_url(host, port), id);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let job = read_json(response).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("Job {}", job["id"]);
    println!("  Resource:    {}", job["resource_name"].as_str().unwrap_or("?"));
    println!("  Source:      {}", job["source_url"].as_str().unwrap_or("?"));
    println!("  Status:      {}", job["status"].as_str().unwrap_or("?"));
    println!("  Submitted:   {}", relative_field(&job, "submitted_at"));
    println!("  Started:     {}", relative_field(&job, "started_at"));
    println!("  Ended:       {}", relative_field(&job, "ended_at"));
    Ok(())
}

/// rdl list
pub async fn cmd_list(host: &str, port: u16, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/resourceDownloader", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let body = read_json(response).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let empty_vec = vec![];
    let jobs = body.as_array().unwrap_or(&empty_vec);

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}{:<24}{:<14}{:<18}{:<18}",
        "ID", "RESOURCE", "STATUS", "SUBMITTED", "ENDED"
    );

    for job in jobs {
        let name = job["resource_name"].as_str().unwrap_or("?");
        let display_name = if name.chars().count() > 23 {
            format!("{}...", name.chars().take(20).collect::<String>())
        } else {
            name.to_string()
        };

        println!(
            "{:<8}{:<24}{:<14}{:<18}{:<18}",
            job["id"].as_u64().map(|id| id.to_string()).unwrap_or_default(),
            display_name,
            job["status"].as_str().unwrap_or("?"),
            relative_field(job, "submitted_at"),
            relative_field(job, "ended_at"),
        );
    }

    Ok(())
}

/// rdl delete
pub async fn cmd_delete(host: &str, port: u16, id: u64) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/resourceDownloader/{}", base_url(host, port), id);

    let response = client
        .delete(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if response.status().as_u16() == 204 {
        println!("Job {} deleted.", id);
        return Ok(());
    }

    read_json(response).await?;
    anyhow::bail!("Unexpected response deleting job {}", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_relative_time_seconds_ago() {
        let dt = Utc::now() - Duration::seconds(30);
        let result = format_relative_time(&dt);
        assert!(result.contains("seconds ago"), "got: {}", result);
    }

    #[test]
    fn test_format_relative_time_minutes_ago() {
        let dt = Utc::now() - Duration::minutes(5);
        assert_eq!(format_relative_time(&dt), "5 minutes ago");
    }

    #[test]
    fn test_format_relative_time_days_ago() {
        let dt = Utc::now() - Duration::days(3);
        assert_eq!(format_relative_time(&dt), "3 days ago");
    }

    #[test]
    fn test_relative_field_missing_is_dash() {
        let job = serde_json::json!({ "ended_at": null });
        assert_eq!(relative_field(&job, "ended_at"), "-");
        assert_eq!(relative_field(&job, "started_at"), "-");
    }

    #[tokio::test]
    async fn test_submit_unreachable_daemon_reports_connection_error() {
        let err = cmd_submit("127.0.0.1", 1, "http://x/y/file.png", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not connect to daemon at 127.0.0.1:1"));
    }
}
