//! Filesystem IPC mediator.
//!
//! Polls `<dataDir>/ipc/<sourceGroup>/{messages,tasks}/*.json`. The source
//! directory name is the writer's identity; no field inside a file is
//! trusted for authorization. Each file is parsed, authorized, applied, and
//! unlinked; malformed or unappliable files are quarantined under
//! `<dataDir>/ipc/errors/`, unauthorized ones are logged and deleted.
//!
//! Files whose canonical path resolves outside the inbox tree (symlink
//! spoofing) are rejected outright.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hearth_core::{normalize_group_id, now_iso, AgentEvent, IpcMessage, IpcSource, IpcTaskOp,
    ScheduledTask, Store};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::registry::GroupRegistry;
use crate::router::OutputRouter;
use crate::scheduler::calculate_next_run;

#[derive(Debug, Clone)]
pub struct IpcSettings {
    /// `<dataDir>/ipc`.
    pub base_dir: PathBuf,
    pub poll_interval: Duration,
    pub assistant_name: String,
    pub main_group_folder: String,
    pub timezone: String,
}

pub struct IpcWatcher {
    settings: IpcSettings,
    store: Store,
    registry: Arc<GroupRegistry>,
    router: Arc<OutputRouter>,
}

impl IpcWatcher {
    pub fn new(
        settings: IpcSettings,
        store: Store,
        registry: Arc<GroupRegistry>,
        router: Arc<OutputRouter>,
    ) -> Self {
        Self {
            settings,
            store,
            registry,
            router,
        }
    }

    /// Run the polling loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        fs::create_dir_all(&self.settings.base_dir).ok();
        info!(dir = %self.settings.base_dir.display(), "IPC mediator started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC mediator shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every source group's inbox.
    pub async fn poll_once(&self) {
        let canonical_base = match fs::canonicalize(&self.settings.base_dir) {
            Ok(p) => p,
            Err(err) => {
                debug!(err = %err, "IPC base directory not readable");
                return;
            }
        };

        let sources = match fs::read_dir(&self.settings.base_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| {
                    e.file_type().is_ok_and(|t| t.is_dir()) && e.file_name() != "errors"
                })
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(err) => {
                debug!(err = %err, "failed to scan IPC base directory");
                return;
            }
        };

        for source in sources {
            let src = IpcSource::new(&source, &self.settings.main_group_folder);
            let source_dir = self.settings.base_dir.join(&source);
            self.process_messages(&source_dir.join("messages"), &src, &canonical_base)
                .await;
            self.process_tasks(&source_dir.join("tasks"), &src, &canonical_base)
                .await;
        }
    }

    async fn process_messages(&self, dir: &Path, src: &IpcSource, canonical_base: &Path) {
        for file in read_json_files(dir) {
            if !inside_tree(canonical_base, &file) {
                warn!(path = %file.display(), "IPC file escapes inbox tree, rejected");
                remove_file(&file);
                continue;
            }

            let msg: IpcMessage = match read_and_parse(&file) {
                Ok(msg) => msg,
                Err(err) => {
                    error!(path = %file.display(), err = %err, "failed to parse IPC message");
                    move_to_errors(&self.settings.base_dir, &file, &src.group_folder);
                    continue;
                }
            };

            if msg.msg_type != "message" || msg.chat_jid.is_empty() || msg.text.is_empty() {
                warn!(path = %file.display(), "invalid IPC message, missing fields");
                move_to_errors(&self.settings.base_dir, &file, &src.group_folder);
                continue;
            }

            let target_id = match normalize_group_id(&msg.chat_jid) {
                Ok(id) => id,
                Err(err) => {
                    warn!(source = src.group_folder.as_str(), err = %err, "bad message target");
                    remove_file(&file);
                    continue;
                }
            };
            let target = self.registry.get(&target_id).await;
            let authorized = src.is_main
                || target
                    .as_ref()
                    .is_some_and(|g| g.folder == src.group_folder);

            match (authorized, target) {
                (true, Some(target)) => {
                    let text = format!("{}: {}", self.settings.assistant_name, msg.text);
                    self.router
                        .emit(&target.id, AgentEvent::Message { text })
                        .await;
                    debug!(
                        source = src.group_folder.as_str(),
                        target = target.id.as_str(),
                        "IPC message dispatched"
                    );
                }
                (true, None) => {
                    warn!(
                        source = src.group_folder.as_str(),
                        target = target_id.as_str(),
                        "IPC message to unknown group, dropped"
                    );
                }
                (false, _) => {
                    warn!(
                        source = src.group_folder.as_str(),
                        target = target_id.as_str(),
                        "unauthorized IPC message blocked"
                    );
                }
            }
            remove_file(&file);
        }
    }

    async fn process_tasks(&self, dir: &Path, src: &IpcSource, canonical_base: &Path) {
        for file in read_json_files(dir) {
            if !inside_tree(canonical_base, &file) {
                warn!(path = %file.display(), "IPC file escapes inbox tree, rejected");
                remove_file(&file);
                continue;
            }

            let op: IpcTaskOp = match read_and_parse(&file) {
                Ok(op) => op,
                Err(err) => {
                    error!(path = %file.display(), err = %err, "failed to parse IPC task op");
                    move_to_errors(&self.settings.base_dir, &file, &src.group_folder);
                    continue;
                }
            };

            match self.apply_task_op(op, src).await {
                Applied::Ok | Applied::Rejected => remove_file(&file),
                Applied::Invalid | Applied::Failed => {
                    move_to_errors(&self.settings.base_dir, &file, &src.group_folder)
                }
            }
        }
    }

    async fn apply_task_op(&self, op: IpcTaskOp, src: &IpcSource) -> Applied {
        match op {
            IpcTaskOp::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_jid,
                ..
            } => {
                let Some(target_raw) = target_jid else {
                    warn!(source = src.group_folder.as_str(), "schedule_task without targetJid");
                    return Applied::Invalid;
                };
                let Ok(target_id) = normalize_group_id(&target_raw) else {
                    warn!(source = src.group_folder.as_str(), "schedule_task with bad targetJid");
                    return Applied::Invalid;
                };
                let Some(target) = self.registry.get(&target_id).await else {
                    warn!(
                        source = src.group_folder.as_str(),
                        target = target_id.as_str(),
                        "schedule_task targets unregistered group"
                    );
                    return Applied::Rejected;
                };
                if !src.is_main && target.folder != src.group_folder {
                    warn!(
                        source = src.group_folder.as_str(),
                        target = target_id.as_str(),
                        "unauthorized schedule_task blocked"
                    );
                    return Applied::Rejected;
                }

                let Some(next_run) = calculate_next_run(
                    &schedule_type,
                    &schedule_value,
                    &self.settings.timezone,
                    Utc::now(),
                ) else {
                    warn!(
                        source = src.group_folder.as_str(),
                        schedule_type = schedule_type.as_str(),
                        schedule_value = schedule_value.as_str(),
                        "schedule_task with invalid schedule, dropped"
                    );
                    return Applied::Rejected;
                };

                let context_mode = if context_mode == "group" {
                    "group".to_string()
                } else {
                    "isolated".to_string()
                };
                let task = ScheduledTask {
                    id: new_task_id(),
                    group_folder: target.folder.clone(),
                    chat_jid: target.id.clone(),
                    prompt,
                    schedule_type,
                    schedule_value,
                    context_mode,
                    next_run: Some(next_run),
                    last_run: None,
                    last_result: None,
                    status: "active".to_string(),
                    created_at: now_iso(),
                };
                match self.store.create_task(&task).await {
                    Ok(()) => {
                        info!(
                            task_id = task.id.as_str(),
                            target = target.id.as_str(),
                            schedule = task.schedule_type.as_str(),
                            "task scheduled"
                        );
                        Applied::Ok
                    }
                    Err(err) => {
                        error!(err = %err, "failed to store scheduled task");
                        Applied::Failed
                    }
                }
            }

            IpcTaskOp::PauseTask { task_id, .. } => {
                self.mutate_task(&task_id, src, TaskMutation::Pause).await
            }
            IpcTaskOp::ResumeTask { task_id, .. } => {
                self.mutate_task(&task_id, src, TaskMutation::Resume).await
            }
            IpcTaskOp::CancelTask { task_id, .. } => {
                self.mutate_task(&task_id, src, TaskMutation::Cancel).await
            }

            IpcTaskOp::RegisterGroup {
                jid,
                name,
                folder,
                trigger,
                container_config,
                ..
            } => {
                if !src.is_main {
                    warn!(
                        source = src.group_folder.as_str(),
                        "unauthorized register_group blocked"
                    );
                    return Applied::Rejected;
                }
                match self
                    .registry
                    .register(&jid, &name, &trigger, container_config)
                    .await
                {
                    Ok(group) => {
                        if group.folder != folder {
                            debug!(
                                requested = folder.as_str(),
                                actual = group.folder.as_str(),
                                "register_group folder normalized"
                            );
                        }
                        Applied::Ok
                    }
                    Err(err) => {
                        error!(err = %err, "register_group failed");
                        Applied::Failed
                    }
                }
            }
        }
    }

    async fn mutate_task(&self, task_id: &str, src: &IpcSource, mutation: TaskMutation) -> Applied {
        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id, "task op for unknown task, dropped");
                return Applied::Rejected;
            }
            Err(err) => {
                error!(task_id, err = %err, "failed to load task");
                return Applied::Failed;
            }
        };

        if !src.is_main && task.group_folder != src.group_folder {
            warn!(
                task_id,
                source = src.group_folder.as_str(),
                "unauthorized task op blocked"
            );
            return Applied::Rejected;
        }

        let result = match mutation {
            TaskMutation::Pause => self.store.set_task_status(task_id, "paused", None).await,
            TaskMutation::Resume => {
                match calculate_next_run(
                    &task.schedule_type,
                    &task.schedule_value,
                    &self.settings.timezone,
                    Utc::now(),
                ) {
                    Some(next) => {
                        self.store
                            .set_task_status(task_id, "active", Some(&next))
                            .await
                    }
                    None => {
                        warn!(task_id, "cannot compute next run on resume, task stays paused");
                        return Applied::Rejected;
                    }
                }
            }
            TaskMutation::Cancel => self.store.delete_task(task_id).await,
        };

        match result {
            Ok(()) => {
                info!(task_id, op = ?mutation, "task op applied");
                Applied::Ok
            }
            Err(err) => {
                error!(task_id, err = %err, "task op failed");
                Applied::Failed
            }
        }
    }
}

enum Applied {
    Ok,
    /// Dropped by an authorization or drop-with-warning rule; deleted.
    Rejected,
    /// Malformed payload; quarantined for debugging.
    Invalid,
    /// Apply hit a store or registry error; quarantined for replay.
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum TaskMutation {
    Pause,
    Resume,
    Cancel,
}

/// Opaque task id: millis plus a short random suffix.
fn new_task_id() -> String {
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let rand = (t.subsec_nanos() ^ (t.as_secs() as u32).wrapping_mul(2654435761)) as u16;
    format!("{}-{:04x}", t.as_millis(), rand)
}

// ── Filesystem helpers ─────────────────────────────────────────────────

fn inside_tree(canonical_base: &Path, path: &Path) -> bool {
    fs::canonicalize(path)
        .map(|real| real.starts_with(canonical_base))
        .unwrap_or(false)
}

/// Sorted `.json` files in a directory; empty if it does not exist.
fn read_json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

fn read_and_parse<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn move_to_errors(base: &Path, file: &Path, source: &str) {
    let errors_dir = base.join("errors");
    fs::create_dir_all(&errors_dir).ok();
    if let Some(name) = file.file_name() {
        let dest = errors_dir.join(format!("{source}-{}", name.to_string_lossy()));
        if let Err(err) = fs::rename(file, &dest) {
            error!(path = %file.display(), err = %err, "failed to quarantine IPC file");
        }
    }
}

fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(path = %path.display(), err = %err, "failed to remove processed IPC file");
    }
}
