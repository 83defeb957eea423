//! Job commands.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use herald_core::{Job, JobPage, JobStats, JobStatus};
use reqwest::Method;
use serde_json::json;

use super::ApiClient;

pub async fn list(
    client: &ApiClient,
    status: Option<JobStatus>,
    job_type: Option<String>,
    page: u32,
    per_page: u32,
) -> Result<()> {
    let mut query = vec![
        ("page", page.to_string()),
        ("per_page", per_page.to_string()),
    ];
    if let Some(status) = status {
        query.push(("status", status.to_string()));
    }
    if let Some(job_type) = job_type {
        query.push(("type", job_type));
    }

    let request = client.request(Method::GET, "jobs")?.query(&query);
    let page: JobPage = client.send(request).await?;

    if page.jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }
    println!(
        "{:<36}  {:<24}  {:<10}  {:>8}  SCHEDULED",
        "ID", "TYPE", "STATUS", "ATTEMPTS"
    );
    for job in &page.jobs {
        println!("{}", job_row(job));
    }
    println!(
        "page {} ({} per page), {} total",
        page.page, page.per_page, page.total
    );
    Ok(())
}

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let request = client.request(Method::GET, &format!("jobs/{}", id))?;
    let job: Job = client.send(request).await?;
    print_job(&job);
    Ok(())
}

pub async fn retry(client: &ApiClient, id: &str, reset_attempts: bool) -> Result<()> {
    let request = client
        .request(Method::POST, &format!("jobs/{}/retry", id))?
        .json(&json!({ "reset_attempts": reset_attempts }));
    let job: Job = client.send(request).await?;
    println!(
        "Job {} re-queued (attempts {}/{})",
        job.id, job.attempts, job.max_attempts
    );
    Ok(())
}

pub async fn cancel(client: &ApiClient, id: &str) -> Result<()> {
    let request = client.request(Method::POST, &format!("jobs/{}/cancel", id))?;
    let job: Job = client.send(request).await?;
    println!("Job {} cancelled", job.id);
    Ok(())
}

pub async fn stats(client: &ApiClient) -> Result<()> {
    let request = client.request(Method::GET, "jobs/stats")?;
    let stats: JobStats = client.send(request).await?;
    println!("pending         {}", stats.pending);
    println!("processing      {}", stats.processing);
    println!("completed       {}", stats.completed);
    println!("failed          {}", stats.failed);
    println!("expired leases  {}", stats.expired_leases);
    Ok(())
}

pub async fn enqueue(
    client: &ApiClient,
    job_type: &str,
    payload: &str,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("payload must be valid JSON")?;
    let request = client.request(Method::POST, "jobs")?.json(&json!({
        "job_type": job_type,
        "payload": payload,
        "scheduled_for": at,
    }));
    let job: Job = client.send(request).await?;
    println!("Enqueued job {} ({})", job.id, job.job_type);
    Ok(())
}

fn job_row(job: &Job) -> String {
    format!(
        "{:<36}  {:<24}  {:<10}  {:>8}  {}",
        job.id.to_string(),
        job.job_type,
        job.status.as_str(),
        format!("{}/{}", job.attempts, job.max_attempts),
        job.scheduled_for.format("%Y-%m-%d %H:%M:%S")
    )
}

fn print_job(job: &Job) {
    println!("id:            {}", job.id);
    println!("type:          {}", job.job_type);
    println!("status:        {}", job.status);
    println!("attempts:      {}/{}", job.attempts, job.max_attempts);
    println!("created:       {}", job.created_at.to_rfc3339());
    println!("scheduled for: {}", job.scheduled_for.to_rfc3339());
    if let (Some(by), Some(until)) = (&job.locked_by, job.locked_until) {
        println!("locked by:     {} until {}", by, until.to_rfc3339());
    }
    if let Some(done) = job.completed_at {
        println!("completed:     {}", done.to_rfc3339());
    }
    if let Some(error) = &job.last_error {
        println!("last error:    {}", error);
    }
    println!("payload:");
    println!(
        "{}",
        serde_json::to_string_pretty(&job.payload).unwrap_or_else(|_| job.payload.to_string())
    );
}
