use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use webpilot::model::{OpenAiClient, OpenAiConfig};
use webpilot::snapshot::Viewport;
use webpilot::{Agent, AgentConfig, BrowserCapability, ChromiumConfig, ChromiumSession, JsonlRecorder};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let session = if let Ok(ws) = std::env::var("CHROME_WS_URL") {
        if !ws.trim().is_empty() {
            ChromiumSession::connect(&ws, Viewport::default()).await?
        } else {
            ChromiumSession::launch(ChromiumConfig { headless: false, ..Default::default() }).await?
        }
    } else {
        ChromiumSession::launch(ChromiumConfig { headless: false, ..Default::default() }).await?
    };

    let model = OpenAiClient::new(OpenAiConfig::default())?;
    let runs_dir = std::env::temp_dir().join("webpilot_runs");
    let recorder = Arc::new(JsonlRecorder::new(runs_dir.clone()));

    let agent = Agent::new(session, model, AgentConfig { max_steps: 40, ..Default::default() })
        .with_recorder(recorder);

    let report = agent
        .run(
            "Find the current top story on Hacker News and report its title.",
            Some("https://news.ycombinator.com"),
        )
        .await;

    println!("status: {:?}", report.status);
    if let Some(result) = &report.final_result {
        println!("result: {result}");
    }
    println!("steps: {} (log under {})", report.step_count, runs_dir.display());

    agent.capability().close().await?;
    Ok(())
}
