use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{
    request_key, tools, McpError, McpRequest, McpResponse, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    PARSE_ERROR, PROTOCOL_VERSION,
};
use crate::handlers::CommandHandler;

/// Serves one client over a line-oriented reader/writer pair.
///
/// Each `tools/call` runs on its own task so calls for different VMs
/// proceed concurrently; same-name calls serialize on the manager's lock.
/// `notifications/cancelled` aborts the task, which drops the in-flight
/// subprocess and kills it.
pub struct McpServer {
    handler: Arc<CommandHandler>,
    in_flight: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl McpServer {
    pub fn new(handler: Arc<CommandHandler>) -> Self {
        Self {
            handler,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn serve_stdio(&self) -> std::io::Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }

    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!(
            "MCP server ready (permission level: {})",
            self.handler.level()
        );
        let (tx, mut rx) = mpsc::unbounded_channel::<McpResponse>();
        let writer_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let mut line = match serde_json::to_string(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("failed to encode response: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut lines = reader.lines();
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => self.dispatch(&line, &mut tasks, &tx),
                    None => break,
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        debug!("input closed, waiting for {} call(s)", tasks.len());
        while tasks.join_next().await.is_some() {}
        drop(tx);
        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
    }

    fn dispatch(&self, line: &str, tasks: &mut JoinSet<()>, tx: &mpsc::UnboundedSender<McpResponse>) {
        let request: McpRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("unparseable message: {}", e);
                let _ = tx.send(McpResponse::err(
                    Value::Null,
                    McpError::new(PARSE_ERROR, format!("parse error: {e}")),
                ));
                return;
            }
        };
        if request.jsonrpc != "2.0" {
            if let Some(id) = request.id {
                let _ = tx.send(McpResponse::err(
                    id,
                    McpError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
                ));
            }
            return;
        }

        let Some(id) = request.id else {
            self.notification(&request.method, request.params.as_ref());
            return;
        };

        let params = request.params.unwrap_or(Value::Null);
        let response = match request.method.as_str() {
            "initialize" => McpResponse::ok(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "vmhub", "version": env!("CARGO_PKG_VERSION") },
                }),
            ),
            "ping" => McpResponse::ok(id, json!({})),
            "tools/list" => McpResponse::ok(id, json!({ "tools": tools::definitions() })),
            "tools/call" => {
                self.spawn_call(id, params, tasks, tx.clone());
                return;
            }
            other => McpResponse::err(
                id,
                McpError::new(METHOD_NOT_FOUND, "Method not found").with_data(json!(other)),
            ),
        };
        let _ = tx.send(response);
    }

    fn spawn_call(&self, id: Value, params: Value, tasks: &mut JoinSet<()>, tx: mpsc::UnboundedSender<McpResponse>) {
        let Some(tool) = params.get("name").and_then(Value::as_str).map(str::to_string) else {
            let _ = tx.send(McpResponse::err(
                id,
                McpError::new(INVALID_PARAMS, "tools/call requires a tool name"),
            ));
            return;
        };
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let key = request_key(&id);
        let handler = self.handler.clone();
        let in_flight = self.in_flight.clone();
        let task_key = key.clone();

        // Registration happens under the same lock the task uses to
        // deregister, so a fast task cannot finish before it is tracked.
        let mut table = self.in_flight.lock();
        let abort = tasks.spawn(async move {
            let response = match tools::call(&handler, &tool, &args).await {
                Ok(payload) => McpResponse::ok(id, tools::tool_result(payload)),
                Err(e) => McpResponse::err(id, e),
            };
            in_flight.lock().remove(&task_key);
            let _ = tx.send(response);
        });
        table.insert(key, abort);
    }

    fn notification(&self, method: &str, params: Option<&Value>) {
        match method {
            "notifications/cancelled" => {
                let Some(id) = params.and_then(|p| p.get("requestId")) else {
                    return;
                };
                let key = request_key(id);
                if let Some(handle) = self.in_flight.lock().remove(&key) {
                    info!("cancelling request {}", key);
                    handle.abort();
                } else {
                    debug!("cancel for unknown or finished request {}", key);
                }
            }
            "notifications/initialized" => debug!("client initialized"),
            other => debug!("ignoring notification {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmHubConfig;
    use crate::vm::process::testing::ScriptedRunner;
    use tokio::io::BufReader;

    async fn exchange(input: &str) -> Vec<Value> {
        let dir = tempfile::tempdir().unwrap();
        let handler = CommandHandler::from_config(
            &VmHubConfig::default(),
            Some(dir.path().to_path_buf()),
            Arc::new(ScriptedRunner::new(&[])),
        )
        .unwrap();
        let server = McpServer::new(Arc::new(handler));

        let (client, server_end) = tokio::io::duplex(64 * 1024);
        server
            .serve(BufReader::new(input.as_bytes()), server_end)
            .await
            .unwrap();

        let mut out = String::new();
        let mut client = BufReader::new(client);
        tokio::io::AsyncReadExt::read_to_string(&mut client, &mut out)
            .await
            .unwrap();
        out.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn handshake_and_tool_listing() {
        let replies = exchange(concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        ))
        .await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["result"]["serverInfo"]["name"], "vmhub");
        assert_eq!(replies[1]["id"], 2);
        assert_eq!(replies[1]["result"]["tools"].as_array().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn tool_failures_are_structured() {
        let replies = exchange(concat!(
            r#"{"jsonrpc":"2.0","id":"a","method":"tools/call","params":{"name":"vm_info","arguments":{"name":"ghost"}}}"#,
            "\n",
        ))
        .await;

        let result = &replies[0]["result"];
        assert_eq!(result["isError"], true);
        assert_eq!(result["structuredContent"]["success"], false);
        assert_eq!(result["structuredContent"]["error"]["kind"], "unavailable");
    }

    #[tokio::test]
    async fn protocol_errors_use_json_rpc_codes() {
        let replies = exchange(concat!(
            "not json\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"vm_explode"}}"#,
            "\n",
        ))
        .await;

        let code = |id: Value| {
            replies
                .iter()
                .find(|r| r["id"] == id)
                .map(|r| r["error"]["code"].as_i64().unwrap())
        };
        assert_eq!(code(Value::Null), Some(PARSE_ERROR as i64));
        assert_eq!(code(json!(3)), Some(METHOD_NOT_FOUND as i64));
        assert_eq!(code(json!(4)), Some(METHOD_NOT_FOUND as i64));
    }
}
