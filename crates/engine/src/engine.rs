use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use toolgate_audit::{hash_args, AuditRecord, AuditSink, AuditStatus};
use toolgate_executor::{ExecSpec, ResourceExecutor, EXIT_TIMEOUT};
use toolgate_notify::{Notification, NotificationSink};
use toolgate_policy::{
    validate_args, NotifyTrigger, PolicyConfig, PolicyStore, ToolBackend, ToolDefinition,
    CONFIRM_ARG_KEY,
};

use crate::handler::ToolHandler;
use crate::request::ExecutionRequest;
use crate::resolve::{check_path_allowlist, resolve_command};
use crate::result::ExecutionResult;

/// One entry in a `list_tools` reply.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub args_schema: Value,
}

/// Orchestrates a request from arrival to sealed result: existence and
/// schema checks, the confirmation gate, execution through the resource
/// executor or a registered handler, then audit and notification.
///
/// Every path returns an `ExecutionResult`; the engine itself never
/// errors out of a request.
pub struct ToolEngine {
    store: Arc<PolicyStore>,
    executor: ResourceExecutor,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationSink>,
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
    caller: String,
}

impl ToolEngine {
    pub fn new(
        store: Arc<PolicyStore>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            executor: ResourceExecutor::new(),
            audit,
            notifier,
            handlers: BTreeMap::new(),
            caller: "local".to_string(),
        }
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    /// Registers the implementation behind a `handler:` tool. Handlers
    /// are resolved lazily at call time, so registration order against
    /// policy loading does not matter.
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Tool catalog in name order. Output for an unchanged policy is
    /// byte-for-byte identical across calls.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let policy = self.store.snapshot();
        policy
            .tools()
            .map(|def| ToolInfo {
                name: def.name.clone(),
                description: def.description.clone(),
                args_schema: def.args_schema.to_json(),
            })
            .collect()
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let policy = self.store.snapshot();
        info!(
            request_id = %request_id,
            tool = %request.tool,
            caller = %self.caller,
            "tool request received"
        );

        // existence
        let Some(def) = policy.tool(&request.tool) else {
            let available = policy.tool_names().join(", ");
            let summary = if available.is_empty() {
                format!("unknown tool '{}'; no tools are configured", request.tool)
            } else {
                format!("unknown tool '{}'; available tools: {available}", request.tool)
            };
            warn!(request_id = %request_id, tool = %request.tool, "unknown tool requested");
            let mut result = ExecutionResult::failure(request_id, summary, "unknown tool");
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            return self.seal(None, &request, result, AuditStatus::Fail, (0, 0)).await;
        };

        // schema
        if let Err(invalid) = validate_args(&def.args_schema, &request.args, &def.name) {
            warn!(
                request_id = %request_id,
                tool = %def.name,
                violations = invalid.violations.len(),
                "arguments rejected"
            );
            let mut result =
                ExecutionResult::failure(request_id, invalid.to_string(), "invalid arguments");
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            return self.seal(Some(def), &request, result, AuditStatus::Fail, (0, 0)).await;
        }

        // path allowlist
        let config = policy.config();
        if config.security.enable_path_validation {
            if let Err(reason) = check_path_allowlist(&request.args, &config.security.allowed_paths)
            {
                warn!(request_id = %request_id, tool = %def.name, %reason, "path rejected");
                let mut result = ExecutionResult::failure(
                    request_id,
                    format!("path validation failed: {reason}"),
                    "path not allowed",
                );
                result.elapsed_ms = started.elapsed().as_millis() as u64;
                return self.seal(Some(def), &request, result, AuditStatus::Fail, (0, 0)).await;
            }
        }

        // confirmation gate
        if def.requires_confirm && !request.confirmed {
            let summary = format!(
                "tool '{}' changes state and requires confirmation; repeat the call with \"{CONFIRM_ARG_KEY}\": true",
                def.name
            );
            info!(request_id = %request_id, tool = %def.name, "stopping at confirmation gate");
            let mut result =
                ExecutionResult::need_confirm(request_id, summary, Some(preview(def, &request.args)));
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            return self.seal(Some(def), &request, result, AuditStatus::NeedConfirm, (0, 0)).await;
        }

        // execution
        let (result, dropped) = match &def.backend {
            ToolBackend::Command(template) => {
                self.run_command(def, config, template, &request.args, request_id).await
            }
            ToolBackend::Builtin(handler) => {
                let timeout = def.timeout(config.default_timeout_sec);
                let result =
                    self.run_builtin(handler, def, &request.args, request_id, timeout).await;
                (result, (0, 0))
            }
        };
        let status = if result.ok { AuditStatus::Ok } else { AuditStatus::Fail };
        self.seal(Some(def), &request, result, status, dropped).await
    }

    async fn run_command(
        &self,
        def: &ToolDefinition,
        config: &PolicyConfig,
        template: &[String],
        args: &Map<String, Value>,
        request_id: String,
    ) -> (ExecutionResult, (u64, u64)) {
        let argv = resolve_command(template, args, &def.args_schema);
        debug!(request_id = %request_id, tool = %def.name, command = ?argv, "executing command");
        let mut spec = ExecSpec::new(
            argv,
            def.timeout(config.default_timeout_sec),
            def.output_cap(config.output_truncate_limit),
        );
        spec.memory_limit_mb = config.security.max_memory_mb;

        match self.executor.run(spec).await {
            Ok(outcome) => {
                let dropped = (outcome.stdout.dropped_bytes, outcome.stderr.dropped_bytes);
                (ExecutionResult::from_outcome(request_id, &def.name, outcome), dropped)
            }
            Err(contract) => {
                // resolution can empty the argv when every element
                // referenced an absent optional argument
                error!(tool = %def.name, error = %contract, "resolved command is not runnable");
                let result = ExecutionResult::failure(
                    request_id,
                    format!("tool '{}' resolved to an unrunnable command: {contract}", def.name),
                    "unrunnable command",
                );
                (result, (0, 0))
            }
        }
    }

    /// Runs a registered handler on its own task so a panic inside it
    /// is contained, under the same timeout a command would get.
    async fn run_builtin(
        &self,
        handler_name: &str,
        def: &ToolDefinition,
        args: &Map<String, Value>,
        request_id: String,
        timeout: Duration,
    ) -> ExecutionResult {
        let Some(handler) = self.handlers.get(handler_name) else {
            error!(
                tool = %def.name,
                handler = %handler_name,
                "policy names a handler that is not registered"
            );
            return ExecutionResult::failure(
                request_id,
                format!(
                    "tool '{}' names handler '{handler_name}' but no such handler is registered",
                    def.name
                ),
                "unregistered handler",
            );
        };

        let started = Instant::now();
        let mut task = {
            let handler = Arc::clone(handler);
            let args = args.clone();
            tokio::spawn(async move { handler.execute(&args).await })
        };

        let mut result = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(output))) => {
                let mut r = ExecutionResult::base(request_id);
                r.ok = true;
                r.summary = output.summary;
                r.data = output.data;
                r
            }
            Ok(Ok(Err(failed))) => ExecutionResult::failure(
                request_id,
                format!("{} failed: {failed}", def.name),
                failed.to_string(),
            ),
            Ok(Err(join_err)) => self.handler_crash(join_err, def, request_id),
            Err(_) => {
                task.abort();
                warn!(
                    tool = %def.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "handler timed out"
                );
                let mut r = ExecutionResult::failure(
                    request_id,
                    format!("{} timed out after {}ms", def.name, timeout.as_millis()),
                    "timeout",
                );
                r.exit_code = EXIT_TIMEOUT;
                r.timed_out = true;
                r
            }
        };
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result
    }

    fn handler_crash(
        &self,
        join_err: JoinError,
        def: &ToolDefinition,
        request_id: String,
    ) -> ExecutionResult {
        if join_err.is_panic() {
            let message = panic_message(join_err);
            error!(tool = %def.name, message = %message, "handler panicked");
            ExecutionResult::failure(
                request_id,
                format!("{} handler panicked: {message}", def.name),
                "handler panic",
            )
        } else {
            error!(tool = %def.name, "handler task cancelled");
            ExecutionResult::failure(
                request_id,
                format!("{} handler was cancelled", def.name),
                "handler cancelled",
            )
        }
    }

    /// Audit first, notify second, and hand back the result untouched.
    /// A failing sink is logged, never propagated: the caller already
    /// owns the outcome of the execution itself.
    async fn seal(
        &self,
        def: Option<&ToolDefinition>,
        request: &ExecutionRequest,
        result: ExecutionResult,
        status: AuditStatus,
        dropped: (u64, u64),
    ) -> ExecutionResult {
        let record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            request_id: result.request_id.clone(),
            tool: request.tool.clone(),
            caller: self.caller.clone(),
            status,
            args_hash: hash_args(&request.args),
            mutates: def.map_or(false, ToolDefinition::is_mutating),
            requires_confirm: def.map_or(false, |d| d.requires_confirm),
            exit_code: result.exit_code,
            elapsed_ms: result.elapsed_ms,
            stdout_dropped_bytes: dropped.0,
            stderr_dropped_bytes: dropped.1,
        };
        if let Err(e) = self.audit.record(&record) {
            error!(request_id = %result.request_id, error = %e, "audit write failed");
        }

        let trigger = match status {
            AuditStatus::Ok => NotifyTrigger::Success,
            AuditStatus::Fail => NotifyTrigger::Failure,
            AuditStatus::NeedConfirm => NotifyTrigger::NeedConfirm,
        };
        // a request for a tool that does not exist still pushes a
        // failure notification; there is no subscription to consult
        let subscribed = def.map_or(trigger == NotifyTrigger::Failure, |d| d.notifies_on(trigger));
        if subscribed {
            let notification = Notification::new(
                request.tool.clone(),
                trigger,
                result.summary.clone(),
                result.request_id.clone(),
            );
            if let Err(e) = self.notifier.notify(&notification).await {
                warn!(request_id = %result.request_id, error = %e, "notification delivery failed");
            }
        }

        info!(
            request_id = %result.request_id,
            tool = %request.tool,
            status = ?status,
            exit_code = result.exit_code,
            elapsed_ms = result.elapsed_ms,
            "request sealed"
        );
        result
    }
}

/// What would run, shown to the caller at the confirmation gate.
fn preview(def: &ToolDefinition, args: &Map<String, Value>) -> Value {
    match &def.backend {
        ToolBackend::Command(template) => {
            json!({ "command": resolve_command(template, args, &def.args_schema) })
        }
        ToolBackend::Builtin(handler) => json!({ "handler": handler }),
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(text) = payload.downcast_ref::<&str>() {
                (*text).to_string()
            } else if let Some(text) = payload.downcast_ref::<String>() {
                text.clone()
            } else {
                "unknown panic".to_string()
            }
        }
        Err(_) => "task aborted".to_string(),
    }
}
