// src/api/stdio.rs

//! JSON-lines front-end for the [`Router`].
//!
//! Each input line is one request:
//!
//! ```json
//! {"id": 1, "method": "POST", "path": "/jobs", "owner": "alice",
//!  "body": {"artifactHash": "...", "startCommand": "./run.sh"}}
//! ```
//!
//! and produces exactly one output line `{"id", "status", "body"}`. `id` is
//! optional and echoed back unchanged. A missing `owner` falls back to the
//! server's default owner.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{ApiRequest, ApiResponse, Router};

#[derive(Debug, Deserialize)]
struct WireRequest {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: ApiRequest,
}

#[derive(Debug, Serialize)]
struct WireResponse {
    id: Option<Value>,
    status: u16,
    body: Value,
}

/// Serve requests from `reader` until EOF, writing responses to `writer`.
pub async fn serve<R, W>(
    router: &Router,
    reader: R,
    mut writer: W,
    default_owner: &str,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut served: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WireRequest>(line) {
            Ok(mut wire) => {
                if wire.request.owner.trim().is_empty() {
                    wire.request.owner = default_owner.to_string();
                }
                let resp = router.handle(&wire.request);
                WireResponse {
                    id: wire.id,
                    status: resp.status,
                    body: resp.body,
                }
            }
            Err(e) => {
                warn!(error = %e, "unparseable request line");
                let resp = ApiResponse::error(400, "bad_request", format!("invalid request: {e}"));
                WireResponse {
                    id: None,
                    status: resp.status,
                    body: resp.body,
                }
            }
        };

        let mut out = serde_json::to_string(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;

        served += 1;
        debug!(served, status = response.status, "response written");
    }

    info!(served, "input closed; stdio server stopping");
    Ok(())
}

/// [`serve`] over the process's stdin/stdout.
pub async fn serve_stdio(router: &Router, default_owner: &str) -> std::io::Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(router, stdin, stdout, default_owner).await
}
