//! Container runner: spawns one agent container per turn cycle, feeds it the
//! prompt request on stdin, and translates its line-delimited stdout records
//! into router events.
//!
//! Before each spawn the runner materializes the two snapshot files the
//! in-container agent reads (tasks and groups views). It also owns the
//! runtime-level helpers: the startup probe, orphan reaping, and the
//! stop/kill commands the queue uses for signaling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future::BoxFuture;
use hearth_core::{
    now_iso, strip_internal_blocks, AgentEvent, AgentInput, AgentRecord, RegisteredGroup, Store,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::queue::ProcessHandle;
use crate::registry::GroupRegistry;

/// Cap on accumulated stdout/stderr kept for the run log.
const MAX_OUTPUT_SIZE: usize = 1_048_576;

#[derive(Debug, Clone)]
pub struct RunnerContext {
    pub runtime_bin: String,
    pub image: String,
    pub name_prefix: String,
    pub data_dir: PathBuf,
    pub groups_dir: PathBuf,
    pub assistant_name: String,
}

pub struct RunRequest {
    pub group: RegisteredGroup,
    pub prompt: String,
    pub session_id: Option<String>,
    pub is_main: bool,
    pub scheduled: bool,
}

pub struct RunOutcome {
    pub success: bool,
    pub new_session_id: Option<String>,
    pub error: Option<String>,
}

/// Invoked for each structured event parsed from container output.
pub type OutputCallback = Arc<dyn Fn(AgentEvent) -> BoxFuture<'static, ()> + Send + Sync>;
/// Invoked once, immediately after the subprocess is spawned.
pub type SpawnCallback = Box<dyn FnOnce(ProcessHandle) -> BoxFuture<'static, ()> + Send>;

/// Run one agent container to completion.
pub async fn run_agent(
    ctx: &RunnerContext,
    store: &Store,
    registry: &GroupRegistry,
    req: RunRequest,
    on_spawn: SpawnCallback,
    on_output: OutputCallback,
) -> anyhow::Result<RunOutcome> {
    let start = Instant::now();
    let folder = req.group.folder.clone();

    let group_dir = ctx.groups_dir.join(&folder);
    let logs_dir = group_dir.join("logs");
    let ipc_dir = ctx.data_dir.join("ipc").join(&folder);
    let snapshot_dir = ctx.data_dir.join("snapshots").join(&folder);
    for dir in [
        &group_dir,
        &logs_dir,
        &ipc_dir.join("messages"),
        &ipc_dir.join("tasks"),
        &snapshot_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    write_snapshots(store, registry, &snapshot_dir, &req.group, req.is_main).await;

    let name = container_name(&ctx.name_prefix, &folder);
    let args = build_run_args(ctx, &req.group, &name, &group_dir, &ipc_dir, &snapshot_dir);

    info!(
        group = req.group.name.as_str(),
        container = name.as_str(),
        is_main = req.is_main,
        "spawning agent container"
    );

    let mut child = Command::new(&ctx.runtime_bin)
        .args(&args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn container for group {folder}"))?;

    let stdin = child.stdin.take().context("container stdin not piped")?;
    let stdout = child.stdout.take().context("container stdout not piped")?;
    let stderr = child.stderr.take().context("container stderr not piped")?;

    let handle = ProcessHandle::new(stdin, name.clone());

    // First turn goes down stdin as one JSON line; stdin stays open for
    // piped follow-up turns until the queue closes it. The write happens
    // before the queue learns about the handle so a concurrent submit
    // cannot pipe a second turn ahead of the first.
    let input = AgentInput {
        prompt: req.prompt.clone(),
        session_id: req.session_id.clone(),
        chat_jid: req.group.id.clone(),
        folder: folder.clone(),
        is_main: req.is_main,
        assistant_name: ctx.assistant_name.clone(),
        is_scheduled_task: req.scheduled.then_some(true),
    };
    {
        let mut guard = handle.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            let mut line = serde_json::to_string(&input).context("serialize agent input")?;
            line.push('\n');
            if let Err(err) = stdin.write_all(line.as_bytes()).await {
                warn!(group = folder.as_str(), err = %err, "failed to write prompt to container");
            } else {
                stdin.flush().await.ok();
            }
        }
    }
    on_spawn(handle.clone()).await;

    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);
    let mut stdout_line = String::new();
    let mut stderr_line = String::new();
    let mut stdout_total = String::new();
    let mut stderr_total = String::new();
    let mut stdout_open = true;
    let mut stderr_open = true;

    let mut new_session_id: Option<String> = None;
    let mut errored = false;
    let mut done_seen = false;
    // A turn is open from prompt write until its done/error marker.
    let mut open_turn = true;

    while stdout_open || stderr_open {
        tokio::select! {
            result = stdout_reader.read_line(&mut stdout_line), if stdout_open => {
                match result {
                    Ok(0) => stdout_open = false,
                    Ok(_) => {
                        accumulate(&mut stdout_total, &stdout_line);
                        let line = stdout_line.trim();
                        if !line.is_empty() {
                            match serde_json::from_str::<AgentRecord>(line) {
                                Ok(record) => {
                                    handle.activity.send(Instant::now()).ok();
                                    match record {
                                        AgentRecord::Message { text } => {
                                            open_turn = true;
                                            let text = strip_internal_blocks(&text);
                                            if !text.is_empty() {
                                                on_output(AgentEvent::Message { text }).await;
                                            }
                                        }
                                        AgentRecord::Session { session_id } => {
                                            open_turn = true;
                                            if let Err(err) = store.set_session(&folder, &session_id).await {
                                                warn!(group = folder.as_str(), err = %err, "failed to persist session");
                                            }
                                            new_session_id = Some(session_id);
                                        }
                                        AgentRecord::Error { error } => {
                                            errored = true;
                                            open_turn = false;
                                            on_output(AgentEvent::Error { error }).await;
                                        }
                                        AgentRecord::Done {} => {
                                            done_seen = true;
                                            open_turn = false;
                                            let session_id = new_session_id
                                                .clone()
                                                .or_else(|| req.session_id.clone());
                                            on_output(AgentEvent::Done { session_id }).await;
                                        }
                                    }
                                }
                                Err(err) => {
                                    debug!(group = folder.as_str(), err = %err, line, "ignoring non-record stdout line");
                                }
                            }
                        }
                        stdout_line.clear();
                    }
                    Err(err) => {
                        warn!(group = folder.as_str(), err = %err, "error reading container stdout");
                        stdout_open = false;
                    }
                }
            }
            result = stderr_reader.read_line(&mut stderr_line), if stderr_open => {
                match result {
                    Ok(0) => stderr_open = false,
                    Ok(_) => {
                        let line = stderr_line.trim();
                        if !line.is_empty() {
                            debug!(container = folder.as_str(), "{line}");
                        }
                        accumulate(&mut stderr_total, &stderr_line);
                        stderr_line.clear();
                    }
                    Err(_) => stderr_open = false,
                }
            }
        }
    }

    let status = child.wait().await.context("failed waiting for container")?;
    let duration = start.elapsed();
    let exit_code = status.code();

    // When the turn is already closed, a done or error marker went out and
    // the exit status carries no extra signal (idle stops exit non-zero).
    let mut run_error = None;
    if open_turn {
        if status.success() {
            // Exit without a done marker still ends the turn cleanly.
            let session_id = new_session_id.clone().or_else(|| req.session_id.clone());
            on_output(AgentEvent::Done { session_id }).await;
        } else {
            errored = true;
            let tail = tail_of(&stderr_total, 500);
            let message = format!(
                "container exited with code {}: {}",
                exit_code.unwrap_or(-1),
                tail
            );
            run_error = Some(message.clone());
            on_output(AgentEvent::Error { error: message }).await;
        }
    }

    write_run_log(
        &logs_dir,
        &req.group.name,
        &name,
        duration,
        exit_code,
        &stdout_total,
        &stderr_total,
    )
    .await;

    if let Err(err) = store
        .set_router_state(&format!("last_activity:{folder}"), &now_iso())
        .await
    {
        warn!(group = folder.as_str(), err = %err, "failed to record last activity");
    }

    info!(
        group = req.group.name.as_str(),
        container = name.as_str(),
        duration_ms = duration.as_millis() as u64,
        exit_code = ?exit_code,
        done_seen,
        errored,
        "container run finished"
    );

    Ok(RunOutcome {
        success: !errored,
        new_session_id,
        error: run_error,
    })
}

/// Write the tasks and groups views the in-container agent reads. Main sees
/// everything; other groups see only themselves.
pub async fn write_snapshots(
    store: &Store,
    registry: &GroupRegistry,
    snapshot_dir: &Path,
    group: &RegisteredGroup,
    is_main: bool,
) {
    let tasks = if is_main {
        store.all_tasks().await
    } else {
        store.tasks_for_group(&group.folder).await
    };
    let tasks_json = match tasks {
        Ok(tasks) => serde_json::to_string_pretty(&tasks).unwrap_or_else(|_| "[]".into()),
        Err(err) => {
            warn!(err = %err, "failed to load tasks for snapshot");
            "[]".into()
        }
    };

    let groups = if is_main {
        registry.list().await
    } else {
        vec![group.clone()]
    };
    let mut entries = Vec::with_capacity(groups.len());
    for g in &groups {
        let last_activity = store
            .get_router_state(&format!("last_activity:{}", g.folder))
            .await
            .ok()
            .flatten();
        entries.push(json!({
            "id": g.id,
            "name": g.name,
            "lastActivity": last_activity,
            "isRegistered": true,
        }));
    }
    let groups_json =
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".into());

    write_atomic(&snapshot_dir.join("tasks.json"), &tasks_json).await;
    write_atomic(&snapshot_dir.join("groups.json"), &groups_json).await;
}

async fn write_atomic(path: &Path, content: &str) {
    let tmp = path.with_extension("json.tmp");
    if let Err(err) = tokio::fs::write(&tmp, content).await {
        warn!(path = %path.display(), err = %err, "failed to write snapshot");
        return;
    }
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        warn!(path = %path.display(), err = %err, "failed to publish snapshot");
    }
}

fn build_run_args(
    ctx: &RunnerContext,
    group: &RegisteredGroup,
    name: &str,
    group_dir: &Path,
    ipc_dir: &Path,
    snapshot_dir: &Path,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-v".to_string(),
        format!("{}:/workspace/group", absolute(group_dir)),
        "-v".to_string(),
        format!("{}:/workspace/ipc", absolute(ipc_dir)),
        "-v".to_string(),
        format!("{}:/workspace/snapshots:ro", absolute(snapshot_dir)),
    ];

    let mut image = ctx.image.clone();
    if let Some(config) = &group.container_config {
        for mount in &config.additional_mounts {
            let suffix = if mount.readonly { ":ro" } else { "" };
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}{suffix}",
                mount.host_path, mount.container_path
            ));
        }
        for key in &config.env {
            if let Ok(value) = std::env::var(key) {
                args.push("-e".to_string());
                args.push(format!("{key}={value}"));
            }
        }
        if let Some(custom) = &config.image {
            image = custom.clone();
        }
    }

    args.push(image);
    args
}

fn absolute(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

/// Container name for a group run: prefix + sanitized folder + millis.
pub fn container_name(prefix: &str, folder: &str) -> String {
    let safe: String = folder
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{prefix}{safe}-{millis}")
}

fn accumulate(total: &mut String, line: &str) {
    let remaining = MAX_OUTPUT_SIZE.saturating_sub(total.len());
    if remaining == 0 {
        return;
    }
    if line.len() > remaining {
        total.push_str(&line[..remaining]);
    } else {
        total.push_str(line);
    }
}

fn tail_of(text: &str, max: usize) -> &str {
    let trimmed = text.trim();
    if trimmed.len() > max {
        let cut = trimmed.len() - max;
        // Back off to a char boundary.
        let mut idx = cut;
        while !trimmed.is_char_boundary(idx) {
            idx += 1;
        }
        &trimmed[idx..]
    } else {
        trimmed
    }
}

async fn write_run_log(
    logs_dir: &Path,
    group_name: &str,
    container_name: &str,
    duration: Duration,
    exit_code: Option<i32>,
    stdout: &str,
    stderr: &str,
) {
    let timestamp = now_iso().replace(':', "-");
    let log_file = logs_dir.join(format!("container-{timestamp}.log"));
    let is_error = exit_code.unwrap_or(0) != 0;

    let mut lines = vec![
        "=== Container Run Log ===".to_string(),
        format!("Timestamp: {timestamp}"),
        format!("Group: {group_name}"),
        format!("Container: {container_name}"),
        format!("Duration: {}ms", duration.as_millis()),
        format!("Exit Code: {exit_code:?}"),
        String::new(),
    ];
    if is_error {
        lines.push("=== Stderr ===".to_string());
        lines.push(stderr.to_string());
        lines.push(String::new());
        lines.push("=== Stdout ===".to_string());
        lines.push(stdout.to_string());
    }

    if let Err(err) = tokio::fs::write(&log_file, lines.join("\n")).await {
        warn!(log_file = %log_file.display(), err = %err, "failed to write run log");
    }
}

// ── Runtime-level helpers ──────────────────────────────────────────────

/// Fail-fast probe that the container runtime is reachable.
pub async fn ensure_runtime_available(runtime_bin: &str) -> anyhow::Result<()> {
    let output = Command::new(runtime_bin)
        .arg("info")
        .output()
        .await
        .with_context(|| format!("container runtime `{runtime_bin}` not found"))?;

    if !output.status.success() {
        anyhow::bail!(
            "container runtime `{runtime_bin}` is not running; start it and retry"
        );
    }
    debug!("container runtime available");
    Ok(())
}

/// Stop containers left over from a previous host process.
pub async fn cleanup_orphans(runtime_bin: &str, name_prefix: &str) {
    let output = match Command::new(runtime_bin)
        .args([
            "ps",
            "--filter",
            &format!("name={name_prefix}"),
            "--format",
            "{{.Names}}",
        ])
        .output()
        .await
    {
        Ok(o) => o,
        Err(err) => {
            warn!(err = %err, "failed to list orphaned containers");
            return;
        }
    };

    let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .collect();

    for name in &names {
        stop_container(runtime_bin, name).await;
    }
    if !names.is_empty() {
        info!(count = names.len(), "stopped orphaned containers");
    }
}

/// Graceful stop (the runtime delivers SIGTERM, then SIGKILL after its own
/// grace period).
pub async fn stop_container(runtime_bin: &str, name: &str) -> bool {
    runtime_signal(runtime_bin, "stop", name).await
}

pub async fn kill_container(runtime_bin: &str, name: &str) -> bool {
    runtime_signal(runtime_bin, "kill", name).await
}

async fn runtime_signal(runtime_bin: &str, verb: &str, name: &str) -> bool {
    match Command::new(runtime_bin).args([verb, name]).output().await {
        Ok(output) if output.status.success() => {
            info!(container = name, verb, "container signaled");
            true
        }
        Ok(output) => {
            warn!(
                container = name,
                verb,
                stderr = String::from_utf8_lossy(&output.stderr).as_ref(),
                "container signal failed"
            );
            false
        }
        Err(err) => {
            error!(container = name, verb, err = %err, "failed to invoke container runtime");
            false
        }
    }
}
