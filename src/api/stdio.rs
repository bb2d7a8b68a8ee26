// =============================================================================
// Stdio transport — line-delimited JSON commands on stdin
// =============================================================================
//
// One JSON command per line in, one JSON response per line out. Parse
// failures answer with an error envelope instead of killing the loop; EOF
// ends the engine.
// =============================================================================

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::api::commands::{dispatch, CommandEnvelope};
use crate::app_state::AppState;

pub async fn run_stdio_loop(state: Arc<AppState>) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    info!("stdio command loop started");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<CommandEnvelope>(&line) {
            Ok(envelope) => {
                debug!(command = %envelope.command, "stdio command");
                dispatch(&state, envelope).await
            }
            Err(e) => json!({
                "id": 0,
                "status": "error",
                "error": { "code": "INVALID_JSON", "message": format!("Failed to parse JSON: {e}") },
            }),
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    info!("stdin closed, stdio loop ending");
    Ok(())
}
