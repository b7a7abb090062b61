//! Child-process script loader.
//!
//! A unit script is any executable file (or any file, when an interpreter is
//! configured). Its first stdin line is a JSON payload:
//!
//! ```json
//! { "unit": "0002-b", "vars": { ... }, "env": { "server": "...", ... } }
//! ```
//!
//! Stdin stays open after the payload: a stdout line starting with
//! `@strata ` is a JSON request served against the current target, and the
//! reply comes back as one JSON line on stdin (`{"ok": true, "value": ...}`
//! or `{"ok": false, "error": "..."}`). `log` requests get no reply:
//!
//! ```text
//! @strata {"op": "log", "level": "warn", "message": "index is stale"}
//! @strata {"op": "patchPreferences", "attributes": {"siteReady": true}}
//! @strata {"op": "importDocuments", "name": "x", "documents": {"a.xml": "<a/>"}}
//! ```
//!
//! Other ops: `getPreferences`, `getObject` and `searchObjects` (by `type`
//! and `key`), `importDir` (`path`, relative to the script) and `uploadFile`
//! (`path`, `content`).
//!
//! Hook scripts are invoked once with `--describe` and must print the names
//! of the hooks they implement (a JSON array or whitespace separated). Each
//! declared hook is then invoked as `<script> <hook-name>` with the hook's
//! arguments under `"args"`. If the last plain stdout line is JSON it is
//! taken as the hook's return value; every other line goes to the run log.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;

use super::{Helpers, ScriptContext, ScriptLoader, UnitScript, unit_name};
use crate::error::{Error, Result};
use crate::feature::Question;
use crate::hooks::{FEATURE_HOOKS, FailureOutcome, FeatureHooks, LIFECYCLE_HOOKS, LifecycleHooks};
use crate::remote::{Attributes, RemoteObject};
use crate::runlog::RunLog;
use crate::state::{FeatureRemoteState, RemoteMigrationState};
use crate::types::VarMap;

#[derive(Debug, Clone, Default)]
pub struct CommandLoader {
    interpreter: Option<PathBuf>,
}

impl CommandLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every script through `interpreter` (e.g. `sh`, `node`).
    pub fn with_interpreter(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: Some(interpreter.into()),
        }
    }

    fn process(&self, path: &Path) -> Result<ScriptProcess> {
        if self.interpreter.is_none() && !is_executable(path) {
            return Err(Error::InvalidUnit {
                unit: unit_name(path),
                reason: "script is not executable and no interpreter is configured".to_string(),
            });
        }
        Ok(ScriptProcess {
            path: std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
            interpreter: self.interpreter.clone(),
        })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[derive(Debug, Clone)]
struct ScriptProcess {
    path: PathBuf,
    interpreter: Option<PathBuf>,
}

impl ScriptProcess {
    fn command(&self) -> tokio::process::Command {
        match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = tokio::process::Command::new(interpreter);
                cmd.arg(&self.path);
                cmd
            }
            None => tokio::process::Command::new(&self.path),
        }
    }

    /// Run with `args`, feeding `payload` on stdin and serving requests
    /// through `bridge`; returns the plain stdout lines on success.
    async fn invoke(
        &self,
        args: &[&str],
        payload: &Value,
        env: &super::LegacyEnv,
        log: &RunLog,
        bridge: Option<&Helpers<'_>>,
    ) -> anyhow::Result<String> {
        let name = unit_name(&self.path);
        let mut cmd = self.command();
        cmd.args(args)
            .env("STRATA_SERVER", &env.server)
            .env("STRATA_IDENTITY", &env.client_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.path.parent() {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", self.path.display()))?;
        let stdin = child.stdin.take().context("script stdin is not piped")?;
        let stdout = child.stdout.take().context("script stdout is not piped")?;
        let mut stderr = child.stderr.take().context("script stderr is not piped")?;

        // Stdin and stderr are serviced on their own tasks; stdout is read here.
        let (replies, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(feed_stdin(stdin, queue));
        let drain = tokio::spawn(async move {
            let mut text = String::new();
            stderr.read_to_string(&mut text).await.map(|_| text)
        });

        let _ = replies.send(json_line(payload)?);

        let mut output = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("Failed to read output of {name}"))?
        {
            match line.strip_prefix(REQUEST_PREFIX) {
                Some(request) => {
                    if let Some(reply) = self.answer(request, bridge, log, &name).await {
                        let _ = replies.send(json_line(&reply)?);
                    }
                }
                None => {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
        }
        drop(replies);

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {name}"))?;
        let _ = writer.await;
        let stderr = drain
            .await
            .context("stderr reader stopped")?
            .with_context(|| format!("Failed to read stderr of {name}"))?;

        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            log.warn(format!("{name}: {line}"));
        }

        if !status.success() {
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output");
            anyhow::bail!("{} exited with {}: {}", name, status, detail);
        }

        Ok(output)
    }

    /// Handle one request line; `None` when the request expects no reply.
    async fn answer(
        &self,
        raw: &str,
        bridge: Option<&Helpers<'_>>,
        log: &RunLog,
        name: &str,
    ) -> Option<Value> {
        let request = match serde_json::from_str::<ScriptRequest>(raw) {
            Ok(request) => request,
            Err(err) => return Some(reply(Err(anyhow::anyhow!("invalid request: {err}")))),
        };
        if let ScriptRequest::Log { level, message } = &request {
            let message = format!("{name}: {message}");
            match level {
                LogLevel::Info => log.info(message),
                LogLevel::Warn => log.warn(message),
                LogLevel::Error => log.error(message),
            }
            return None;
        }
        let Some(bridge) = bridge else {
            return Some(reply(Err(anyhow::anyhow!(
                "target requests are not available while describing hooks"
            ))));
        };
        let base = self.path.parent().unwrap_or_else(|| Path::new("."));
        Some(reply(serve(request, bridge, base).await))
    }
}

/// Marks a stdout line as a request to the engine.
const REQUEST_PREFIX: &str = "@strata ";

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum ScriptRequest {
    Log {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
    GetPreferences,
    PatchPreferences {
        attributes: Attributes,
    },
    GetObject {
        #[serde(rename = "type")]
        object_type: String,
        key: String,
    },
    SearchObjects {
        #[serde(rename = "type")]
        object_type: String,
    },
    ImportDir {
        path: PathBuf,
    },
    ImportDocuments {
        name: String,
        documents: BTreeMap<String, String>,
    },
    UploadFile {
        path: String,
        content: String,
    },
}

async fn serve(
    request: ScriptRequest,
    bridge: &Helpers<'_>,
    base: &Path,
) -> anyhow::Result<Value> {
    match request {
        ScriptRequest::Log { .. } => Ok(Value::Null),
        ScriptRequest::GetPreferences => Ok(Value::Object(bridge.read_preferences().await?)),
        ScriptRequest::PatchPreferences { attributes } => {
            bridge.patch_preferences(attributes).await?;
            Ok(Value::Null)
        }
        ScriptRequest::GetObject { object_type, key } => {
            let object = bridge.remote.get_object(&object_type, &key).await?;
            Ok(object_json(&object))
        }
        ScriptRequest::SearchObjects { object_type } => {
            let objects = bridge.remote.search_objects(&object_type).await?;
            Ok(Value::Array(objects.iter().map(object_json).collect()))
        }
        ScriptRequest::ImportDir { path } => {
            bridge.import_dir(&base.join(path)).await?;
            Ok(Value::Null)
        }
        ScriptRequest::ImportDocuments { name, documents } => {
            let documents: Vec<(&str, String)> = documents
                .iter()
                .map(|(path, body)| (path.as_str(), body.clone()))
                .collect();
            bridge.import_documents(&name, &documents).await?;
            Ok(Value::Null)
        }
        ScriptRequest::UploadFile { path, content } => {
            bridge.upload_file(&path, content.into_bytes()).await?;
            Ok(Value::Null)
        }
    }
}

fn object_json(object: &RemoteObject) -> Value {
    json!({ "key": object.key, "attributes": object.attributes })
}

fn reply(result: anyhow::Result<Value>) -> Value {
    match result {
        Ok(value) => json!({ "ok": true, "value": value }),
        Err(err) => json!({ "ok": false, "error": format!("{err:#}") }),
    }
}

fn json_line(value: &Value) -> anyhow::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value).context("Failed to encode script message")?;
    line.push(b'\n');
    Ok(line)
}

/// Forward queued lines to the script until the queue closes.
async fn feed_stdin(mut stdin: ChildStdin, mut queue: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(line) = queue.recv().await {
        // A script that stops reading closes the pipe; remaining lines are dropped.
        if stdin.write_all(&line).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

/// Split stdout into log lines and an optional trailing JSON value.
fn split_output(stdout: &str) -> (Vec<&str>, Option<Value>) {
    let mut lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    let value = lines
        .last()
        .and_then(|last| serde_json::from_str::<Value>(last.trim()).ok());
    if value.is_some() {
        lines.pop();
    }
    (lines, value)
}

fn parse_declared(stdout: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(stdout.trim()) {
        Ok(names) => names,
        Err(_) => stdout.split_whitespace().map(str::to_string).collect(),
    }
}

struct ProcessUnit {
    process: ScriptProcess,
}

#[async_trait]
impl UnitScript for ProcessUnit {
    async fn run(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        let unit = self
            .process
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let payload = json!({ "unit": unit, "vars": ctx.vars, "env": ctx.env });
        let stdout = self
            .process
            .invoke(&[], &payload, &ctx.env, ctx.log, Some(&ctx.helpers))
            .await?;
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            ctx.log.info(format!("{unit}: {line}"));
        }
        Ok(())
    }
}

/// A hook script plus the hook names it declared.
struct HookProcess {
    process: ScriptProcess,
    declared: BTreeSet<String>,
}

impl HookProcess {
    async fn describe(process: ScriptProcess, known: &[&str]) -> Result<Self> {
        let log = RunLog::new();
        let env = super::LegacyEnv::default();
        let stdout = process
            .invoke(&["--describe"], &json!({}), &env, &log, None)
            .await
            .map_err(|e| Error::InvalidUnit {
                unit: unit_name(&process.path),
                reason: format!("failed to describe hooks: {e:#}"),
            })?;

        let mut declared = BTreeSet::new();
        for name in parse_declared(&stdout) {
            if !known.contains(&name.as_str()) {
                return Err(Error::InvalidUnit {
                    unit: unit_name(&process.path),
                    reason: format!("unknown hook '{name}' (expected one of: {})", known.join(", ")),
                });
            }
            declared.insert(name);
        }
        Ok(Self { process, declared })
    }

    fn declares(&self, hook: &str) -> bool {
        self.declared.contains(hook)
    }

    async fn call(
        &self,
        hook: &str,
        ctx: &ScriptContext<'_>,
        args: Value,
    ) -> anyhow::Result<Option<Value>> {
        let payload = json!({ "hook": hook, "args": args, "vars": ctx.vars, "env": ctx.env });
        let stdout = self
            .process
            .invoke(&[hook], &payload, &ctx.env, ctx.log, Some(&ctx.helpers))
            .await?;
        let (lines, value) = split_output(&stdout);
        for line in lines {
            ctx.log.info(format!("{hook}: {line}"));
        }
        Ok(value)
    }
}

fn state_json(state: &RemoteMigrationState) -> Value {
    json!({
        "schemaVersion": state.schema_version,
        "appliedUnits": state.applied_units,
        "registeredIdentities": state.registered_identities,
        "variables": state.variables,
    })
}

struct CommandHooks(HookProcess);

#[async_trait]
impl LifecycleHooks for CommandHooks {
    async fn init(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        if self.0.declares("init") {
            self.0.call("init", ctx, json!({})).await?;
        }
        Ok(())
    }

    async fn should_bootstrap(
        &self,
        ctx: &ScriptContext<'_>,
        state: Option<&RemoteMigrationState>,
    ) -> anyhow::Result<bool> {
        if !self.0.declares("should_bootstrap") {
            return Ok(false);
        }
        let args = json!({ "state": state.map(state_json) });
        let value = self.0.call("should_bootstrap", ctx, args).await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn on_bootstrap(
        &self,
        ctx: &ScriptContext<'_>,
        state: &mut RemoteMigrationState,
    ) -> anyhow::Result<()> {
        if !self.0.declares("on_bootstrap") {
            return Ok(());
        }
        let args = json!({ "state": state_json(state) });
        if let Some(value) = self.0.call("on_bootstrap", ctx, args).await?
            && let Some(vars) = value.get("variables")
        {
            state.variables = serde_json::from_value::<VarMap>(vars.clone())
                .context("on_bootstrap returned invalid variables")?;
        }
        Ok(())
    }

    async fn before_all(
        &self,
        ctx: &ScriptContext<'_>,
        pending: &[String],
        will_apply: bool,
        dry_run: bool,
    ) -> anyhow::Result<()> {
        if self.0.declares("before_all") {
            let args = json!({ "pending": pending, "willApply": will_apply, "dryRun": dry_run });
            self.0.call("before_all", ctx, args).await?;
        }
        Ok(())
    }

    async fn before_each(
        &self,
        ctx: &ScriptContext<'_>,
        unit: &str,
        will_apply: bool,
    ) -> anyhow::Result<bool> {
        if !self.0.declares("before_each") {
            return Ok(true);
        }
        let args = json!({ "unit": unit, "willApply": will_apply });
        let value = self.0.call("before_each", ctx, args).await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(true))
    }

    async fn after_each(
        &self,
        ctx: &ScriptContext<'_>,
        unit: &str,
        will_apply: bool,
    ) -> anyhow::Result<()> {
        if self.0.declares("after_each") {
            let args = json!({ "unit": unit, "willApply": will_apply });
            self.0.call("after_each", ctx, args).await?;
        }
        Ok(())
    }

    async fn after_all(
        &self,
        ctx: &ScriptContext<'_>,
        ran: &[String],
        will_apply: bool,
    ) -> anyhow::Result<()> {
        if self.0.declares("after_all") {
            let args = json!({ "ran": ran, "willApply": will_apply });
            self.0.call("after_all", ctx, args).await?;
        }
        Ok(())
    }

    async fn on_failure(
        &self,
        ctx: &ScriptContext<'_>,
        unit: &str,
        error: &anyhow::Error,
    ) -> anyhow::Result<FailureOutcome> {
        if !self.0.declares("on_failure") {
            return Ok(FailureOutcome::Propagate);
        }
        let args = json!({ "unit": unit, "error": format!("{error:#}") });
        self.0.call("on_failure", ctx, args).await?;
        Ok(FailureOutcome::Handled)
    }
}

struct CommandFeatureHooks(HookProcess);

#[async_trait]
impl FeatureHooks for CommandFeatureHooks {
    async fn before_deploy(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        if self.0.declares("before_deploy") {
            self.0.call("before_deploy", ctx, json!({})).await?;
        }
        Ok(())
    }

    async fn questions(
        &self,
        ctx: &ScriptContext<'_>,
        state: &FeatureRemoteState,
    ) -> anyhow::Result<Option<Vec<Question>>> {
        if !self.0.declares("questions") {
            return Ok(None);
        }
        let deployed: Vec<&str> = state.instances.keys().map(String::as_str).collect();
        let args = json!({ "deployedFeatures": deployed });
        match self.0.call("questions", ctx, args).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .context("questions hook returned an invalid question list"),
            None => Ok(Some(Vec::new())),
        }
    }

    async fn finish(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        if self.0.declares("finish") {
            self.0.call("finish", ctx, json!({})).await?;
        }
        Ok(())
    }

    async fn remove(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        if self.0.declares("remove") {
            self.0.call("remove", ctx, json!({})).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptLoader for CommandLoader {
    async fn load_unit(&self, path: &Path) -> Result<Arc<dyn UnitScript>> {
        let process = self.process(path)?;
        Ok(Arc::new(ProcessUnit { process }))
    }

    async fn load_hooks(&self, path: &Path) -> Result<Arc<dyn LifecycleHooks>> {
        let process = self.process(path)?;
        let hooks = HookProcess::describe(process, LIFECYCLE_HOOKS).await?;
        Ok(Arc::new(CommandHooks(hooks)))
    }

    async fn load_feature_hooks(&self, path: &Path) -> Result<Arc<dyn FeatureHooks>> {
        let process = self.process(path)?;
        let hooks = HookProcess::describe(process, FEATURE_HOOKS).await?;
        Ok(Arc::new(CommandFeatureHooks(hooks)))
    }
}
