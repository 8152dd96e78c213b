//! Task scheduler: wakes once a second, fires active tasks whose next_run
//! has arrived, and pushes their prompts through the same group-queue path
//! chat uses.
//!
//! Durability rule: next_run is advanced (or the task deleted, for `once`)
//! *before* the submission is awaited, so a crash mid-fire can never replay
//! the same occurrence.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hearth_core::store::to_store_ts;
use hearth_core::{now_iso, Store};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::queue::{GroupQueue, PendingPrompt};
use crate::registry::GroupRegistry;

/// Prepended to scheduled prompts so the agent can tell automated turns
/// from user turns.
pub const SCHEDULED_PREFIX: &str = "[SCHEDULED TASK - The following message was sent \
automatically and is not coming directly from the user or group.]\n\n";

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub timezone: String,
}

/// Compute the next firing instant after `after`.
///
/// - `cron`: next occurrence strictly after `after` in the configured
///   timezone. Standard 5-field expressions get a seconds field prepended.
/// - `interval`: `after` + positive milliseconds.
/// - `once`: the literal instant, RFC 3339 or a naive local timestamp.
pub fn calculate_next_run(
    schedule_type: &str,
    schedule_value: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Option<String> {
    match schedule_type {
        "cron" => {
            let expr = if schedule_value.split_whitespace().count() == 5 {
                format!("0 {schedule_value}")
            } else {
                schedule_value.to_string()
            };
            let schedule = match cron::Schedule::from_str(&expr) {
                Ok(s) => s,
                Err(err) => {
                    warn!(cron = schedule_value, err = %err, "invalid cron expression");
                    return None;
                }
            };
            let tz: chrono_tz::Tz = match timezone.parse() {
                Ok(tz) => tz,
                Err(_) => {
                    warn!(tz = timezone, "invalid timezone, falling back to UTC");
                    chrono_tz::Tz::UTC
                }
            };
            schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|dt| to_store_ts(dt.with_timezone(&Utc)))
        }
        "interval" => {
            let ms: i64 = match schedule_value.parse() {
                Ok(v) if v > 0 => v,
                _ => {
                    warn!(value = schedule_value, "invalid interval milliseconds");
                    return None;
                }
            };
            Some(to_store_ts(after + chrono::Duration::milliseconds(ms)))
        }
        "once" => parse_once(schedule_value, timezone).map(to_store_ts),
        other => {
            warn!(schedule_type = other, "unknown schedule type");
            None
        }
    }
}

/// Parse a `once` schedule value: RFC 3339, or a naive timestamp taken in
/// the configured timezone (agents send local timestamps without a zone).
pub fn parse_once(value: &str, timezone: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok()?;
    let tz: chrono_tz::Tz = timezone.parse().unwrap_or(chrono_tz::Tz::UTC);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Run the scheduler tick loop until the shutdown signal fires.
pub async fn run_scheduler_loop(
    settings: SchedulerSettings,
    store: Store,
    registry: Arc<GroupRegistry>,
    queue: Arc<GroupQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        timezone = settings.timezone.as_str(),
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(settings.poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler shutting down");
                    return;
                }
            }
        }

        if let Err(err) = fire_due_tasks(&settings, &store, &registry, &queue).await {
            error!(err = %err, "scheduler tick failed");
        }
    }
}

/// One tick: fire every active task whose next_run has arrived.
pub async fn fire_due_tasks(
    settings: &SchedulerSettings,
    store: &Store,
    registry: &GroupRegistry,
    queue: &GroupQueue,
) -> anyhow::Result<usize> {
    let now = now_iso();
    let due = store.due_tasks(&now).await?;
    if due.is_empty() {
        return Ok(0);
    }
    info!(count = due.len(), "due tasks");

    let mut fired = 0;
    for task in due {
        if registry.get(&task.chat_jid).await.is_none() {
            warn!(
                task_id = task.id.as_str(),
                target = task.chat_jid.as_str(),
                "task targets unregistered group, pausing"
            );
            store.set_task_status(&task.id, "paused", None).await?;
            continue;
        }

        let firing_instant = task
            .next_run
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        // Advance before submitting so a restart mid-fire cannot replay.
        let is_once = task.schedule_type == "once";
        if is_once {
            store.delete_task(&task.id).await?;
        } else {
            match calculate_next_run(
                &task.schedule_type,
                &task.schedule_value,
                &settings.timezone,
                firing_instant,
            ) {
                Some(next) => store.advance_task(&task.id, &next).await?,
                None => {
                    warn!(
                        task_id = task.id.as_str(),
                        "cannot compute next run, pausing task"
                    );
                    store.set_task_status(&task.id, "paused", None).await?;
                    continue;
                }
            }
        }

        let prompt = PendingPrompt {
            prompt: format!("{SCHEDULED_PREFIX}{}", task.prompt),
            isolated: task.context_mode != "group",
            scheduled: true,
        };
        let result = queue.submit(&task.chat_jid, prompt).await;
        let summary = match &result {
            Ok(crate::queue::Submitted::Piped) => "submitted: piped".to_string(),
            Ok(crate::queue::Submitted::Queued) => "submitted: queued".to_string(),
            Err(err) => format!("Error: {err}"),
        };
        debug!(
            task_id = task.id.as_str(),
            group = task.chat_jid.as_str(),
            summary = summary.as_str(),
            "task fired"
        );

        if !is_once {
            if let Err(err) = store.record_task_run(&task.id, &summary).await {
                error!(task_id = task.id.as_str(), err = %err, "failed to record task run");
            }
        }
        fired += 1;
    }

    Ok(fired)
}
