//! Per-group serialization queue.
//!
//! At most one live container per group. A submitted prompt is piped to the
//! live container's stdin when it is open, otherwise it lands in the group's
//! single pending-prompt slot and a drive task runs it through the injected
//! process-prompt callback. Prompts within a group are strictly FIFO; groups
//! progress independently.
//!
//! The queue owns the subprocess handle: stdin closure, the idle watchdog,
//! and terminate/kill signaling all go through here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use hearth_core::TurnRequest;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::runner::{kill_container, stop_container};

/// Callback that runs one pending prompt for a group. Returns true on a
/// successful container run.
pub type ProcessPromptFn =
    Arc<dyn Fn(String, PendingPrompt) -> BoxFuture<'static, bool> + Send + Sync>;

/// Probe asking whether a group currently has an output subscriber. Drives
/// the pending-prompt conflict rule.
pub type SubscriberProbe = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub idle_timeout: Duration,
    pub exit_grace: Duration,
    pub runtime_bin: String,
}

/// Handle to a live container subprocess, shared between the runner (which
/// reads stdout) and the queue (which owns stdin and signaling).
#[derive(Clone)]
pub struct ProcessHandle {
    pub stdin: Arc<Mutex<Option<ChildStdin>>>,
    pub container_name: String,
    /// Last-output instant; the runner pings this on every parsed record.
    pub activity: Arc<watch::Sender<Instant>>,
}

impl ProcessHandle {
    pub fn new(stdin: ChildStdin, container_name: String) -> Self {
        let (activity, _) = watch::channel(Instant::now());
        Self {
            stdin: Arc::new(Mutex::new(Some(stdin))),
            container_name,
            activity: Arc::new(activity),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPrompt {
    pub prompt: String,
    /// Run without the persistent session (scheduled isolated tasks).
    pub isolated: bool,
    /// Fired by the scheduler rather than a user.
    pub scheduled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Piped,
    Queued,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("a prompt is already pending for this group")]
    Conflict,
    #[error("shutting down, not accepting prompts")]
    ShuttingDown,
}

#[derive(Default)]
struct GroupState {
    process: Option<ProcessHandle>,
    running: bool,
    pending: Option<PendingPrompt>,
    watchdog: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    groups: HashMap<String, GroupState>,
    shutting_down: bool,
    process_prompt_fn: Option<ProcessPromptFn>,
    subscriber_probe: Option<SubscriberProbe>,
}

impl Inner {
    fn get_or_insert(&mut self, group_id: &str) -> &mut GroupState {
        self.groups.entry(group_id.to_string()).or_default()
    }
}

pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
    config: Arc<QueueConfig>,
}

impl GroupQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            config: Arc::new(config),
        }
    }

    pub async fn set_process_prompt_fn(&self, f: ProcessPromptFn) {
        self.inner.lock().await.process_prompt_fn = Some(f);
    }

    pub async fn set_subscriber_probe(&self, probe: SubscriberProbe) {
        self.inner.lock().await.subscriber_probe = Some(probe);
    }

    /// Submit a prompt for a group: pipe it to the live container when its
    /// stdin is open, otherwise park it in the pending slot and make sure a
    /// drive task is processing the group.
    pub async fn submit(
        &self,
        group_id: &str,
        prompt: PendingPrompt,
    ) -> Result<Submitted, SubmitError> {
        let stdin_slot = {
            let inner = self.inner.lock().await;
            if inner.shutting_down {
                return Err(SubmitError::ShuttingDown);
            }
            inner
                .groups
                .get(group_id)
                .and_then(|s| s.process.as_ref())
                .map(|p| p.stdin.clone())
        };

        if let Some(slot) = stdin_slot {
            let mut guard = slot.lock().await;
            if let Some(stdin) = guard.as_mut() {
                let mut line = serde_json::to_string(&TurnRequest {
                    prompt: prompt.prompt.clone(),
                })
                .unwrap_or_default();
                line.push('\n');
                match write_line(stdin, &line).await {
                    Ok(()) => {
                        debug!(group_id, "prompt piped to live container");
                        return Ok(Submitted::Piped);
                    }
                    Err(err) => {
                        warn!(group_id, err = %err, "stdin write failed, falling back to queue");
                        *guard = None;
                    }
                }
            }
        }

        let spawn_drive = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return Err(SubmitError::ShuttingDown);
            }
            let observed = inner
                .subscriber_probe
                .as_ref()
                .map(|probe| probe(group_id))
                .unwrap_or(false);
            let state = inner.get_or_insert(group_id);
            if state.pending.is_some() && observed {
                return Err(SubmitError::Conflict);
            }
            if state.pending.is_some() {
                debug!(group_id, "replacing unobserved pending prompt");
            }
            state.pending = Some(prompt);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };

        if spawn_drive {
            let inner = self.inner.clone();
            let group = group_id.to_string();
            tokio::spawn(drive_group(inner, group));
        }

        Ok(Submitted::Queued)
    }

    /// Called by the container runner as soon as the subprocess is spawned.
    /// Stores the handle and arms the idle watchdog.
    pub async fn register_process(&self, group_id: &str, handle: ProcessHandle) {
        let mut inner = self.inner.lock().await;
        let watchdog = tokio::spawn(idle_watchdog(
            self.inner.clone(),
            self.config.clone(),
            group_id.to_string(),
            handle.clone(),
        ));
        let state = inner.get_or_insert(group_id);
        if let Some(old) = state.watchdog.replace(watchdog) {
            old.abort();
        }
        state.process = Some(handle);
    }

    /// Close the live container's stdin, signaling end of input.
    pub async fn close_stdin(&self, group_id: &str) {
        let slot = {
            let inner = self.inner.lock().await;
            inner
                .groups
                .get(group_id)
                .and_then(|s| s.process.as_ref())
                .map(|p| p.stdin.clone())
        };
        if let Some(slot) = slot {
            if slot.lock().await.take().is_some() {
                info!(group_id, "container stdin closed");
            }
        }
    }

    /// Send a terminate signal to the group's live container, if any.
    /// Returns whether a live subprocess existed.
    pub async fn terminate_group(&self, group_id: &str) -> bool {
        let name = {
            let inner = self.inner.lock().await;
            inner
                .groups
                .get(group_id)
                .and_then(|s| s.process.as_ref())
                .map(|p| p.container_name.clone())
        };
        match name {
            Some(name) => {
                let bin = self.config.runtime_bin.clone();
                info!(group_id, container = name.as_str(), "terminating container");
                tokio::spawn(async move {
                    stop_container(&bin, &name).await;
                });
                true
            }
            None => false,
        }
    }

    /// Graceful drain: refuse new submits, close every live stdin, wait up
    /// to `timeout` for runs to finish, then force-kill the stragglers.
    pub async fn shutdown(&self, timeout: Duration) {
        let (stdin_slots, _names) = {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;
            let slots: Vec<_> = inner
                .groups
                .values()
                .filter_map(|s| s.process.as_ref().map(|p| p.stdin.clone()))
                .collect();
            let names: Vec<_> = inner
                .groups
                .values()
                .filter_map(|s| s.process.as_ref().map(|p| p.container_name.clone()))
                .collect();
            (slots, names)
        };

        info!(live = stdin_slots.len(), "queue draining");
        for slot in stdin_slots {
            slot.lock().await.take();
        }

        let deadline = Instant::now() + timeout;
        loop {
            let busy = {
                let inner = self.inner.lock().await;
                inner.groups.values().any(|s| s.running)
            };
            if !busy {
                info!("queue drained cleanly");
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let leftovers: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .groups
                .values()
                .filter_map(|s| s.process.as_ref().map(|p| p.container_name.clone()))
                .collect()
        };
        for name in leftovers {
            error!(container = name.as_str(), "drain timeout, killing container");
            kill_container(&self.config.runtime_bin, &name).await;
        }
    }

    pub async fn has_live_process(&self, group_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .groups
            .get(group_id)
            .is_some_and(|s| s.process.is_some())
    }

    pub async fn pending_prompt(&self, group_id: &str) -> Option<PendingPrompt> {
        let inner = self.inner.lock().await;
        inner.groups.get(group_id).and_then(|s| s.pending.clone())
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

/// Runs pending prompts for one group, one at a time, until the slot stays
/// empty. Exactly one drive task exists per group while `running` is set.
async fn drive_group(inner: Arc<Mutex<Inner>>, group_id: String) {
    loop {
        let (pending, process_fn) = {
            let mut guard = inner.lock().await;
            let f = guard.process_prompt_fn.clone();
            let state = guard.get_or_insert(&group_id);
            match state.pending.take() {
                Some(p) => (p, f),
                None => {
                    state.running = false;
                    return;
                }
            }
        };

        let ok = match process_fn {
            Some(f) => f(group_id.clone(), pending).await,
            None => {
                warn!(group_id = group_id.as_str(), "no process prompt fn wired, dropping prompt");
                false
            }
        };
        if !ok {
            debug!(group_id = group_id.as_str(), "prompt run reported failure");
        }

        // The run is over; release the subprocess registration.
        let mut guard = inner.lock().await;
        if let Some(state) = guard.groups.get_mut(&group_id) {
            state.process = None;
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.abort();
            }
        }
    }
}

/// Watches a live container for output inactivity. On expiry the stdin is
/// closed; the container is expected to exit on EOF. If it lingers past the
/// grace period it is stopped, then killed.
async fn idle_watchdog(
    inner: Arc<Mutex<Inner>>,
    config: Arc<QueueConfig>,
    group_id: String,
    handle: ProcessHandle,
) {
    let mut rx = handle.activity.subscribe();
    loop {
        let last = *rx.borrow();
        let elapsed = last.elapsed();
        if elapsed >= config.idle_timeout {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(config.idle_timeout - elapsed) => {}
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }

    info!(group_id = group_id.as_str(), "idle timeout, closing container stdin");
    handle.stdin.lock().await.take();

    tokio::time::sleep(config.exit_grace).await;
    if !process_still_registered(&inner, &group_id, &handle.container_name).await {
        return;
    }
    warn!(
        group_id = group_id.as_str(),
        container = handle.container_name.as_str(),
        "container lingering after stdin close, stopping"
    );
    stop_container(&config.runtime_bin, &handle.container_name).await;

    tokio::time::sleep(config.exit_grace).await;
    if !process_still_registered(&inner, &group_id, &handle.container_name).await {
        return;
    }
    error!(
        group_id = group_id.as_str(),
        container = handle.container_name.as_str(),
        "container ignored stop, killing"
    );
    kill_container(&config.runtime_bin, &handle.container_name).await;
}

async fn process_still_registered(
    inner: &Arc<Mutex<Inner>>,
    group_id: &str,
    container_name: &str,
) -> bool {
    let guard = inner.lock().await;
    guard
        .groups
        .get(group_id)
        .and_then(|s| s.process.as_ref())
        .is_some_and(|p| p.container_name == container_name)
}
