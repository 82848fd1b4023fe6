//! Function executor: policy gate, validation gate, confirmation gate,
//! then the host side effect.

use super::catalog::FunctionCatalog;
use super::guards::{
    self, WindowAction, clamp_volume, resolve_application, validate_command, validate_path,
    validate_url,
};
use super::{FunctionError, host};
use crate::clock::Clock;
use crate::config::FunctionsConfig;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use url::Url;

/// A call that has cleared the validation gate. Holds the resolved
/// values so dispatch performs the side effect without re-deriving or
/// re-checking anything.
enum ValidatedCall {
    LaunchApplication { executable: &'static str },
    OpenFile { path: PathBuf },
    OpenUrl { url: Url },
    RunCommand { command: String },
    GetSystemInfo,
    GetTimeDate,
    ListFiles { path: PathBuf },
    CreateFile { path: PathBuf, content: String },
    ReadFile { path: PathBuf },
    DeleteFile { path: PathBuf },
    MoveFile { source: PathBuf, destination: PathBuf },
    SearchFiles { directory: PathBuf, pattern: String },
    ManageWindow { title: String, action: WindowAction },
    SetVolume { level: u8 },
}

/// A pending request for the user to approve or deny a side effect.
///
/// The confirmation channel owner calls [`respond`](Self::respond) exactly
/// once; the oneshot underneath makes a second resolution impossible.
#[derive(Debug)]
pub struct ConfirmationRequest {
    /// Unique confirmation id.
    pub id: String,
    /// Function awaiting approval.
    pub function: String,
    /// The validated arguments.
    pub arguments: Value,
    /// Human-readable description for the prompt.
    pub description: String,
    respond_to: oneshot::Sender<bool>,
}

impl ConfirmationRequest {
    /// Resolve the request. Returns `true` if the executor was still
    /// waiting for the answer.
    pub fn respond(self, approved: bool) -> bool {
        self.respond_to.send(approved).is_ok()
    }
}

/// Result of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// JSON payload returned to the backend.
    pub result: Value,
    /// Wall-clock execution time in milliseconds.
    pub execution_time_ms: u64,
}

/// Validates, authorizes, and performs function calls.
pub struct FunctionExecutor {
    catalog: FunctionCatalog,
    blocked: HashSet<String>,
    require_confirmation: HashSet<String>,
    confirmation_tx: Option<mpsc::Sender<ConfirmationRequest>>,
    bases: Vec<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl FunctionExecutor {
    /// Build an executor from the configured policy lists.
    pub fn new(config: &FunctionsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog: FunctionCatalog::new(),
            blocked: config.blocked.iter().cloned().collect(),
            require_confirmation: config.require_confirmation.iter().cloned().collect(),
            confirmation_tx: None,
            bases: guards::allowed_bases(),
            clock,
        }
    }

    /// Register the external confirmation channel. Without one, every
    /// confirmation-gated call is denied.
    pub fn set_confirmation_channel(&mut self, tx: mpsc::Sender<ConfirmationRequest>) {
        self.confirmation_tx = Some(tx);
    }

    /// Override the path sandbox bases (tests).
    pub fn set_allowed_bases(&mut self, bases: Vec<PathBuf>) {
        self.bases = bases;
    }

    /// The catalog this executor enforces.
    pub fn catalog(&self) -> &FunctionCatalog {
        &self.catalog
    }

    /// Execute a named function against JSON arguments.
    ///
    /// Gates run in order: policy (blocked, unknown), validation (schema
    /// plus per-function safety checks), confirmation. A call with an
    /// invalid target fails at gate 2 and never reaches the confirmation
    /// channel. On success the host side effect runs with a 30 s process
    /// timeout.
    pub async fn execute(&self, name: &str, args: &Value) -> Result<ExecutionOutcome, FunctionError> {
        // Gate 1: policy.
        if self.blocked.contains(name) {
            warn!(function = name, "function blocked by policy");
            return Err(FunctionError::Blocked(name.to_owned()));
        }
        let def = self
            .catalog
            .get(name)
            .ok_or_else(|| FunctionError::UnknownFunction(name.to_owned()))?;

        // Gate 2: validation — schema first, then the per-function
        // safety checks (path sandbox, URL sandbox, command filter, app
        // whitelist, action enum, clamps).
        validate_args(name, args, &def.parameters)?;
        let call = self.validate_call(name, args)?;

        // Gate 3: confirmation.
        if self.require_confirmation.contains(name) {
            self.confirm(name, args).await?;
        }

        info!(
            function = name,
            arguments = %sanitize_args(args),
            "executing function"
        );

        let start = Instant::now();
        let result = self.dispatch(call).await?;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        info!(function = name, duration_ms = execution_time_ms, "function completed");

        Ok(ExecutionOutcome {
            result,
            execution_time_ms,
        })
    }

    /// Ask the confirmation channel for approval; deny when no channel is
    /// registered or the answer is anything but an explicit yes.
    async fn confirm(&self, name: &str, args: &Value) -> Result<(), FunctionError> {
        let Some(tx) = &self.confirmation_tx else {
            warn!(function = name, "no confirmation channel registered, denying");
            return Err(FunctionError::NotApproved(name.to_owned()));
        };

        let (respond_to, answer) = oneshot::channel();
        let request = ConfirmationRequest {
            id: uuid::Uuid::new_v4().to_string(),
            function: name.to_owned(),
            arguments: args.clone(),
            description: describe(name, args),
            respond_to,
        };

        tx.send(request)
            .await
            .map_err(|_| FunctionError::NotApproved(name.to_owned()))?;

        match answer.await {
            Ok(true) => Ok(()),
            // Channel dropped or explicit denial both count as "no".
            _ => Err(FunctionError::NotApproved(name.to_owned())),
        }
    }

    /// Gate 2, second half: the per-function safety checks. Resolves the
    /// arguments into a [`ValidatedCall`] or fails with the matching
    /// typed error.
    fn validate_call(&self, name: &str, args: &Value) -> Result<ValidatedCall, FunctionError> {
        match name {
            "launch_application" => Ok(ValidatedCall::LaunchApplication {
                executable: resolve_application(str_arg(args, "name")?)?,
            }),
            "open_file" => Ok(ValidatedCall::OpenFile {
                path: validate_path(str_arg(args, "path")?, &self.bases)?,
            }),
            "open_url" => Ok(ValidatedCall::OpenUrl {
                url: validate_url(str_arg(args, "url")?)?,
            }),
            "run_command" => Ok(ValidatedCall::RunCommand {
                command: validate_command(str_arg(args, "command")?)?,
            }),
            "get_system_info" => Ok(ValidatedCall::GetSystemInfo),
            "get_time_date" => Ok(ValidatedCall::GetTimeDate),
            "list_files" => Ok(ValidatedCall::ListFiles {
                path: validate_path(str_arg(args, "path")?, &self.bases)?,
            }),
            "create_file" => {
                let content = str_arg(args, "content")?;
                guards::validate_content_size(content)?;
                Ok(ValidatedCall::CreateFile {
                    path: validate_path(str_arg(args, "path")?, &self.bases)?,
                    content: content.to_owned(),
                })
            }
            "read_file" => Ok(ValidatedCall::ReadFile {
                path: validate_path(str_arg(args, "path")?, &self.bases)?,
            }),
            "delete_file" => Ok(ValidatedCall::DeleteFile {
                path: validate_path(str_arg(args, "path")?, &self.bases)?,
            }),
            "move_file" => Ok(ValidatedCall::MoveFile {
                source: validate_path(str_arg(args, "source")?, &self.bases)?,
                destination: validate_path(str_arg(args, "destination")?, &self.bases)?,
            }),
            "search_files" => Ok(ValidatedCall::SearchFiles {
                directory: validate_path(str_arg(args, "directory")?, &self.bases)?,
                pattern: str_arg(args, "pattern")?.to_owned(),
            }),
            "manage_window" => Ok(ValidatedCall::ManageWindow {
                title: str_arg(args, "title")?.to_owned(),
                action: WindowAction::parse(str_arg(args, "action")?)?,
            }),
            "set_volume" => {
                let level = args.get("level").and_then(Value::as_i64).ok_or_else(|| {
                    FunctionError::InvalidArguments("level must be an integer".into())
                })?;
                Ok(ValidatedCall::SetVolume {
                    level: clamp_volume(level),
                })
            }
            // Catalog gate already rejected unknown names.
            other => Err(FunctionError::UnknownFunction(other.to_owned())),
        }
    }

    async fn dispatch(&self, call: ValidatedCall) -> Result<Value, FunctionError> {
        match call {
            ValidatedCall::LaunchApplication { executable } => {
                host::launch_application(executable)
            }
            ValidatedCall::OpenFile { path } => {
                host::open_with_default(&path.display().to_string())
            }
            ValidatedCall::OpenUrl { url } => host::open_with_default(url.as_str()),
            ValidatedCall::RunCommand { command } => host::run_shell_query(&command).await,
            ValidatedCall::GetSystemInfo => Ok(host::system_info()),
            ValidatedCall::GetTimeDate => Ok(host::time_date(self.clock.now())),
            ValidatedCall::ListFiles { path } => host::list_files(&path).await,
            ValidatedCall::CreateFile { path, content } => {
                host::create_file(&path, &content).await
            }
            ValidatedCall::ReadFile { path } => host::read_file(&path).await,
            ValidatedCall::DeleteFile { path } => host::delete_file(&path).await,
            ValidatedCall::MoveFile {
                source,
                destination,
            } => host::move_file(&source, &destination).await,
            ValidatedCall::SearchFiles { directory, pattern } => {
                host::search_files(&directory, &pattern).await
            }
            ValidatedCall::ManageWindow { title, action } => {
                host::manage_window(&title, action).await
            }
            ValidatedCall::SetVolume { level } => host::set_volume(level).await,
        }
    }
}

/// Validate arguments against a function's parameter schema: required
/// keys present, declared types match, enum members respected. Extra
/// fields are tolerated (open schema).
pub fn validate_args(name: &str, args: &Value, schema: &Value) -> Result<(), FunctionError> {
    let obj = args.as_object().ok_or_else(|| {
        FunctionError::InvalidArguments(format!("{name}: arguments must be an object"))
    })?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                return Err(FunctionError::InvalidArguments(format!(
                    "{name}: missing required field '{key}'"
                )));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (key, value) in obj {
        let Some(prop) = properties.get(key) else {
            continue;
        };

        if let Some(expected) = prop.get("type").and_then(Value::as_str) {
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !matches {
                return Err(FunctionError::InvalidArguments(format!(
                    "{name}: field '{key}' expected {expected}"
                )));
            }
        }

        if let Some(allowed) = prop.get("enum").and_then(Value::as_array)
            && !allowed.contains(value)
        {
            return Err(FunctionError::InvalidArguments(format!(
                "{name}: field '{key}' must be one of the declared values"
            )));
        }
    }

    Ok(())
}

/// Human-readable description for the confirmation prompt.
fn describe(name: &str, args: &Value) -> String {
    match name {
        "delete_file" => format!(
            "Delete the file {}",
            args.get("path").and_then(Value::as_str).unwrap_or("?")
        ),
        "move_file" => format!(
            "Move {} to {}",
            args.get("source").and_then(Value::as_str).unwrap_or("?"),
            args.get("destination").and_then(Value::as_str).unwrap_or("?")
        ),
        other => format!("Run {other} with {}", sanitize_args(args)),
    }
}

/// Compact argument rendering for logs and prompts: string values are
/// capped so file content never floods the log.
fn sanitize_args(args: &Value) -> String {
    const MAX_VALUE_CHARS: usize = 80;
    match args.as_object() {
        Some(obj) => {
            let parts: Vec<String> = obj
                .iter()
                .map(|(k, v)| {
                    let rendered = match v.as_str() {
                        Some(s) if s.chars().count() > MAX_VALUE_CHARS => {
                            format!("\"{}…\"", s.chars().take(MAX_VALUE_CHARS).collect::<String>())
                        }
                        _ => v.to_string(),
                    };
                    format!("{k}={rendered}")
                })
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        None => args.to_string(),
    }
}

/// Serialize a function failure into the typed error payload returned to
/// the backend, so the model can recover or apologise.
pub fn error_payload(err: &FunctionError) -> Value {
    json!({
        "error": err.code(),
        "message": err.to_string(),
    })
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, FunctionError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| FunctionError::InvalidArguments(format!("missing string field '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn executor_with_temp_base() -> (FunctionExecutor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut executor =
            FunctionExecutor::new(&FunctionsConfig::default(), Arc::new(ManualClock::default()));
        executor.set_allowed_bases(vec![dir.path().to_path_buf()]);
        (executor, dir)
    }

    // ── Gate 1: policy ────────────────────────────────────────

    #[tokio::test]
    async fn blocked_function_is_rejected_first() {
        let (executor, _dir) = executor_with_temp_base();
        let result = executor
            .execute("run_arbitrary_powershell", &json!({}))
            .await;
        assert!(matches!(result, Err(FunctionError::Blocked(_))));
    }

    #[tokio::test]
    async fn unknown_function_is_rejected() {
        let (executor, _dir) = executor_with_temp_base();
        let result = executor.execute("format_disk", &json!({})).await;
        assert!(matches!(result, Err(FunctionError::UnknownFunction(_))));
    }

    // ── Gate 2: validation ────────────────────────────────────

    #[tokio::test]
    async fn missing_required_field_is_invalid() {
        let (executor, _dir) = executor_with_temp_base();
        let result = executor.execute("read_file", &json!({})).await;
        assert!(matches!(result, Err(FunctionError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn wrong_type_is_invalid() {
        let (executor, _dir) = executor_with_temp_base();
        let result = executor.execute("read_file", &json!({"path": 42})).await;
        assert!(matches!(result, Err(FunctionError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn out_of_sandbox_path_is_denied() {
        let (executor, _dir) = executor_with_temp_base();
        let result = executor
            .execute("read_file", &json!({"path": "/etc/passwd"}))
            .await;
        assert!(matches!(result, Err(FunctionError::PathDenied(_))));
    }

    #[tokio::test]
    async fn window_action_outside_enum_is_invalid() {
        let (executor, _dir) = executor_with_temp_base();
        let result = executor
            .execute("manage_window", &json!({"title": "x", "action": "vaporize"}))
            .await;
        assert!(matches!(result, Err(FunctionError::InvalidArguments(_))));
    }

    // ── Gate ordering ─────────────────────────────────────────

    #[tokio::test]
    async fn denied_path_fails_before_confirmation() {
        // No channel registered: a valid target would fail NotApproved,
        // but an invalid one must fail validation first.
        let (executor, _dir) = executor_with_temp_base();
        let result = executor
            .execute("delete_file", &json!({"path": "/etc/passwd"}))
            .await;
        assert!(matches!(result, Err(FunctionError::PathDenied(_))));
    }

    #[tokio::test]
    async fn confirmation_channel_not_consulted_for_invalid_target() {
        let (mut executor, _dir) = executor_with_temp_base();
        let (tx, mut rx) = mpsc::channel(1);
        executor.set_confirmation_channel(tx);

        let result = executor
            .execute("delete_file", &json!({"path": "/etc/passwd"}))
            .await;
        assert!(matches!(result, Err(FunctionError::PathDenied(_))));

        // The user was never asked about a doomed call.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_create_content_is_invalid() {
        let (executor, dir) = executor_with_temp_base();
        let target = dir.path().join("big.txt");
        let content = "x".repeat(10 * 1024 * 1024 + 1);
        let result = executor
            .execute(
                "create_file",
                &json!({"path": target.to_str().unwrap(), "content": content}),
            )
            .await;
        assert!(matches!(result, Err(FunctionError::InvalidArguments(_))));
        assert!(!target.exists());
    }

    // ── Gate 3: confirmation ──────────────────────────────────

    #[tokio::test]
    async fn confirmation_required_without_channel_denies() {
        let (executor, dir) = executor_with_temp_base();
        let target = dir.path().join("y.txt");
        tokio::fs::write(&target, "keep me").await.unwrap();

        let result = executor
            .execute("delete_file", &json!({"path": target.to_str().unwrap()}))
            .await;
        assert!(matches!(result, Err(FunctionError::NotApproved(_))));
        assert!(target.exists(), "file must survive a denied delete");
    }

    #[tokio::test]
    async fn confirmation_deny_leaves_file_in_place() {
        let (mut executor, dir) = executor_with_temp_base();
        let (tx, mut rx) = mpsc::channel(1);
        executor.set_confirmation_channel(tx);

        // Denying channel owner.
        tokio::spawn(async move {
            if let Some(request) = rx.recv().await {
                assert_eq!(request.function, "delete_file");
                assert!(!request.description.is_empty());
                request.respond(false);
            }
        });

        let target = dir.path().join("y.txt");
        tokio::fs::write(&target, "keep me").await.unwrap();

        let result = executor
            .execute("delete_file", &json!({"path": target.to_str().unwrap()}))
            .await;
        assert!(matches!(result, Err(FunctionError::NotApproved(_))));
        assert!(target.exists());
    }

    #[tokio::test]
    async fn confirmation_approve_performs_delete() {
        let (mut executor, dir) = executor_with_temp_base();
        let (tx, mut rx) = mpsc::channel(1);
        executor.set_confirmation_channel(tx);

        tokio::spawn(async move {
            if let Some(request) = rx.recv().await {
                request.respond(true);
            }
        });

        let target = dir.path().join("z.txt");
        tokio::fs::write(&target, "bye").await.unwrap();

        let outcome = executor
            .execute("delete_file", &json!({"path": target.to_str().unwrap()}))
            .await
            .unwrap();
        assert_eq!(outcome.result["deleted"], target.to_str().unwrap());
        assert!(!target.exists());
    }

    // ── Side effects ──────────────────────────────────────────

    #[tokio::test]
    async fn read_file_happy_path() {
        let (executor, dir) = executor_with_temp_base();
        let target = dir.path().join("x.txt");
        tokio::fs::write(&target, "hello").await.unwrap();

        let outcome = executor
            .execute("read_file", &json!({"path": target.to_str().unwrap()}))
            .await
            .unwrap();
        assert_eq!(outcome.result["content"], "hello");
        assert_eq!(outcome.result["size"], 5);
    }

    #[tokio::test]
    async fn get_time_date_reads_injected_clock() {
        use chrono::TimeZone;
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
            10,
        );
        let mut executor = FunctionExecutor::new(&FunctionsConfig::default(), Arc::new(clock));
        executor.set_allowed_bases(vec![dir.path().to_path_buf()]);

        let outcome = executor.execute("get_time_date", &json!({})).await.unwrap();
        assert_eq!(outcome.result["date"], "2025-03-01");
    }

    // ── Helpers ───────────────────────────────────────────────

    #[test]
    fn sanitize_caps_long_values() {
        let args = json!({"content": "x".repeat(500), "path": "/tmp/a"});
        let rendered = sanitize_args(&args);
        assert!(rendered.len() < 250);
        assert!(rendered.contains("…"));
    }

    #[test]
    fn error_payload_carries_stable_code() {
        let payload = error_payload(&FunctionError::PathDenied("/etc/passwd".into()));
        assert_eq!(payload["error"], "path_denied");
        assert!(payload["message"].as_str().unwrap().contains("/etc/passwd"));
    }

    #[test]
    fn validate_args_accepts_extra_fields() {
        let schema = json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        });
        let args = json!({"path": "/tmp/x", "verbose": true});
        assert!(validate_args("read_file", &args, &schema).is_ok());
    }
}
