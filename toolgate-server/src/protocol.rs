use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

use toolgate_engine::{ExecutionRequest, ExecutionResult, ToolEngine};
use toolgate_policy::PolicyStore;

/// One request line from the agent. The `method` field selects the
/// variant; unknown methods fail deserialization and come back as a
/// protocol error.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RequestEnvelope {
    ListTools,
    CallTool {
        name: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    ReloadPolicy,
}

#[derive(Debug, Serialize)]
pub struct Metrics {
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

impl Metrics {
    fn zero() -> Self {
        Self {
            exit_code: 0,
            elapsed_ms: 0,
            timed_out: false,
            stdout_truncated: false,
            stderr_truncated: false,
            stdout_bytes: 0,
            stderr_bytes: 0,
        }
    }
}

/// One response line. Exactly one envelope goes out per non-blank
/// input line, in order, whatever happened inside.
#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub ok: bool,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub data: Option<Value>,
    pub stdout: String,
    pub stderr: String,
    pub needs_confirmation: bool,
    pub metrics: Metrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    fn plain(summary: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            ok: true,
            summary: summary.into(),
            request_id: None,
            data,
            stdout: String::new(),
            stderr: String::new(),
            needs_confirmation: false,
            metrics: Metrics::zero(),
            error: None,
        }
    }

    fn rejected(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            summary: summary.into(),
            request_id: None,
            data: None,
            stdout: String::new(),
            stderr: String::new(),
            needs_confirmation: false,
            metrics: Metrics::zero(),
            error: Some(error.into()),
        }
    }

    fn from_result(result: ExecutionResult) -> Self {
        Self {
            ok: result.ok,
            summary: result.summary,
            request_id: Some(result.request_id),
            data: result.data,
            stdout: result.stdout,
            stderr: result.stderr,
            needs_confirmation: result.needs_confirmation,
            metrics: Metrics {
                exit_code: result.exit_code,
                elapsed_ms: result.elapsed_ms,
                timed_out: result.timed_out,
                stdout_truncated: result.stdout_truncated,
                stderr_truncated: result.stderr_truncated,
                stdout_bytes: result.stdout_bytes,
                stderr_bytes: result.stderr_bytes,
            },
            error: result.error,
        }
    }
}

pub async fn handle_line(
    engine: &ToolEngine,
    store: &PolicyStore,
    line: &str,
) -> ResponseEnvelope {
    let request = match serde_json::from_str::<RequestEnvelope>(line) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "rejected malformed request line");
            return ResponseEnvelope::rejected("request rejected", format!("invalid request: {e}"));
        }
    };

    match request {
        RequestEnvelope::ListTools => {
            let tools = engine.list_tools();
            ResponseEnvelope::plain(
                format!("{} tools available", tools.len()),
                Some(json!({ "tools": tools })),
            )
        }
        RequestEnvelope::CallTool { name, args } => {
            let result = engine.execute(ExecutionRequest::from_wire(name, args)).await;
            ResponseEnvelope::from_result(result)
        }
        RequestEnvelope::ReloadPolicy => match store.reload() {
            Ok(count) => ResponseEnvelope::plain(format!("policy reloaded, {count} tools active"), None),
            Err(e) => ResponseEnvelope::rejected(
                "policy reload failed, previous policy still active",
                e.to_string(),
            ),
        },
    }
}

/// Reads newline-delimited JSON requests until EOF and answers each on
/// the output stream. Blank lines are skipped without a response.
pub async fn serve<R, W>(
    engine: &ToolEngine,
    store: &PolicyStore,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(engine, store, &line).await;
        let payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize response");
                serde_json::to_string(&ResponseEnvelope::rejected(
                    "internal error",
                    "response serialization failed",
                ))
                .unwrap_or_else(|_| String::from("{\"ok\":false}"))
            }
        };
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    info!("input stream closed, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    use tokio::io::BufReader;

    use toolgate_audit::{AuditError, AuditRecord, AuditSink};
    use toolgate_notify::NullNotifier;

    struct DiscardAudit;

    impl AuditSink for DiscardAudit {
        fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
            Ok(())
        }
    }

    const POLICY: &str = r#"
config:
  default_timeout_sec: 5
  output_truncate_limit: 8000
tools:
  echo_line:
    description: Echo a message back
    command: ["echo", "{message}"]
    args_schema:
      type: object
      properties:
        message:
          type: string
      required: [message]
  scratch_write:
    description: Touch a file
    command: ["touch", "{path}"]
    mutates: true
    requires_confirm: true
    args_schema:
      type: object
      properties:
        path:
          type: string
      required: [path]
"#;

    fn setup(dir: &tempfile::TempDir) -> (ToolEngine, Arc<PolicyStore>) {
        let path = dir.path().join("policy.yaml");
        fs::write(&path, POLICY).unwrap();
        let store = Arc::new(PolicyStore::load(&path).unwrap());
        let engine = ToolEngine::new(
            Arc::clone(&store),
            Arc::new(DiscardAudit),
            Arc::new(NullNotifier),
        );
        (engine, store)
    }

    fn as_json(envelope: &ResponseEnvelope) -> Value {
        serde_json::to_value(envelope).unwrap()
    }

    #[tokio::test]
    async fn test_list_tools_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = setup(&dir);

        let response = handle_line(&engine, &store, r#"{"method":"list_tools"}"#).await;
        let value = as_json(&response);

        assert_eq!(value["ok"], json!(true));
        assert_eq!(value["summary"], json!("2 tools available"));
        let tools = value["data"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], json!("echo_line"));
        assert_eq!(tools[1]["name"], json!("scratch_write"));
        // listing carries no per-request identity
        assert!(value.get("request_id").is_none());
    }

    #[tokio::test]
    async fn test_call_tool_success_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = setup(&dir);

        let line = r#"{"method":"call_tool","name":"echo_line","args":{"message":"over the wire"}}"#;
        let response = handle_line(&engine, &store, line).await;
        let value = as_json(&response);

        assert_eq!(value["ok"], json!(true));
        assert_eq!(value["stdout"], json!("over the wire\n"));
        // data is always present, null when the tool produced none
        assert_eq!(value["data"], Value::Null);
        assert_eq!(value["metrics"]["exit_code"], json!(0));
        assert_eq!(value["needs_confirmation"], json!(false));
        assert!(value["request_id"].as_str().unwrap().len() > 10);
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_call_tool_args_default_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = setup(&dir);

        // no args key at all: schema validation reports the missing
        // required property instead of a protocol error
        let line = r#"{"method":"call_tool","name":"echo_line"}"#;
        let response = handle_line(&engine, &store, line).await;

        assert!(!response.ok);
        assert!(response.error.unwrap().contains("message"));
    }

    #[tokio::test]
    async fn test_confirmation_flow_over_wire() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = setup(&dir);
        let target = dir.path().join("made.txt");
        let target_str = target.to_str().unwrap();

        let ask = format!(
            r#"{{"method":"call_tool","name":"scratch_write","args":{{"path":"{target_str}"}}}}"#
        );
        let response = handle_line(&engine, &store, &ask).await;
        assert!(!response.ok);
        assert!(response.needs_confirmation);
        assert!(!target.exists());

        let confirmed = format!(
            r#"{{"method":"call_tool","name":"scratch_write","args":{{"path":"{target_str}","_confirm":true}}}}"#
        );
        let response = handle_line(&engine, &store, &confirmed).await;
        assert!(response.ok);
        assert!(!response.needs_confirmation);
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_malformed_json_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = setup(&dir);

        let response = handle_line(&engine, &store, "{not json").await;

        assert!(!response.ok);
        assert_eq!(response.summary, "request rejected");
        assert!(response.error.unwrap().contains("invalid request"));
    }

    #[tokio::test]
    async fn test_unknown_method_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = setup(&dir);

        let response = handle_line(&engine, &store, r#"{"method":"dance"}"#).await;

        assert!(!response.ok);
        assert!(response.error.unwrap().contains("unknown variant"));
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_tools() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = setup(&dir);
        assert_eq!(engine.list_tools().len(), 2);

        let extended = format!(
            "{POLICY}  say_hi:\n    description: Say hi\n    command: [\"echo\", \"hi\"]\n"
        );
        fs::write(store.path(), extended).unwrap();

        let response = handle_line(&engine, &store, r#"{"method":"reload_policy"}"#).await;
        assert!(response.ok);
        assert_eq!(response.summary, "policy reloaded, 3 tools active");
        assert_eq!(engine.list_tools().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_serving_old_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = setup(&dir);

        fs::write(store.path(), "tools: {broken: {}}").unwrap();

        let response = handle_line(&engine, &store, r#"{"method":"reload_policy"}"#).await;
        assert!(!response.ok);
        assert!(response.summary.contains("previous policy still active"));
        assert_eq!(engine.list_tools().len(), 2);
    }

    #[tokio::test]
    async fn test_serve_answers_every_line_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, store) = setup(&dir);

        let input = concat!(
            r#"{"method":"list_tools"}"#,
            "\n\n   \n",
            r#"{"method":"call_tool","name":"echo_line","args":{"message":"first"}}"#,
            "\n",
            "garbage\n",
            r#"{"method":"call_tool","name":"echo_line","args":{"message":"second"}}"#,
            "\n",
        );
        let mut output: Vec<u8> = Vec::new();

        serve(&engine, &store, BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        // blank lines produce nothing; garbage still gets an envelope
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["summary"], json!("2 tools available"));
        assert_eq!(lines[1]["stdout"], json!("first\n"));
        assert_eq!(lines[2]["ok"], json!(false));
        assert_eq!(lines[3]["stdout"], json!("second\n"));
    }
}
