//! Interactive console session against the orchestrator.
//! Notifications that land in the outbox (verification codes included)
//! are echoed so the flow can be completed locally.

use support_agent_orchestrator::{AgentConfig, Orchestrator};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = AgentConfig::from_env()?;
    let (orchestrator, outbox) = Orchestrator::from_config(&config).await?;

    let session_id = uuid::Uuid::new_v4().to_string();
    info!(session_id = %session_id, oracle = orchestrator.oracle_name(), "Console session started");

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seen_notifications = 0;

    stdout
        .write_all(b"Support agent ready. Type a message, or 'quit' to exit.\n")
        .await?;

    loop {
        stdout.write_all(b"\nyou> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit") {
            break;
        }

        let response = orchestrator.handle_turn(&session_id, input).await;
        stdout
            .write_all(format!("agent> {}\n", response.answer).as_bytes())
            .await?;

        for call in &response.trace.calls {
            let status = match (call.success, call.degraded) {
                (true, false) => "ok",
                (true, true) => "ok (fallback)",
                (false, _) => "failed",
            };
            stdout
                .write_all(format!("  [{}: {}]\n", call.name, status).as_bytes())
                .await?;
        }

        let sent = outbox.sent().await;
        for notification in sent.iter().skip(seen_notifications) {
            stdout
                .write_all(
                    format!(
                        "  [outbox -> {}] {}\n{}\n",
                        notification.recipient, notification.subject, notification.body
                    )
                    .as_bytes(),
                )
                .await?;
        }
        seen_notifications = sent.len();
    }

    orchestrator.end_session(&session_id).await?;
    Ok(())
}
