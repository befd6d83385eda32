//! Check whether a dashboard is answering on this machine
//!
//! Run with: cargo run --bin check_server

use std::process::ExitCode;
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let url = format!("http://localhost:{}/api/health", port);

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("Dashboard is running at http://localhost:{}", port);
            ExitCode::SUCCESS
        }
        Ok(resp) => {
            eprintln!("Dashboard answered with status {}", resp.status());
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Dashboard is not reachable at {}: {}", url, e);
            eprintln!("Start it with: cargo run --bin agent-dashboard");
            ExitCode::FAILURE
        }
    }
}
