//! IPC file formats shared between container agents and the host.
//!
//! Agents write JSON files into `/workspace/ipc/{messages,tasks}/` (mounted
//! from `<dataDir>/ipc/<sourceGroup>/`). The host polls those directories,
//! applies each file, and unlinks it. The directory name is the asserted
//! identity of the writer; nothing inside the file is trusted for identity.

use serde::{Deserialize, Serialize};

use crate::group::GroupContainerConfig;

/// Outbound message from a container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    /// Must be "message".
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Target group id.
    #[serde(rename = "chatJid")]
    pub chat_jid: String,
    pub text: String,
    /// Informational; identity comes from the directory, never this field.
    #[serde(rename = "groupFolder")]
    pub group_folder: Option<String>,
    pub timestamp: Option<String>,
}

/// Task or registry command from a container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcTaskOp {
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default = "default_context_mode")]
        context_mode: String,
        #[serde(rename = "targetJid")]
        target_jid: Option<String>,
        #[serde(rename = "createdBy")]
        created_by: Option<String>,
        timestamp: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
        timestamp: Option<String>,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
        timestamp: Option<String>,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
        timestamp: Option<String>,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        trigger: String,
        #[serde(rename = "containerConfig")]
        container_config: Option<GroupContainerConfig>,
        timestamp: Option<String>,
    },
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

/// Authorization context derived from the inbox directory name.
#[derive(Debug, Clone)]
pub struct IpcSource {
    pub group_folder: String,
    pub is_main: bool,
}

impl IpcSource {
    pub fn new(group_folder: impl Into<String>, main_group_folder: &str) -> Self {
        let group_folder = group_folder.into();
        let is_main = group_folder == main_group_folder;
        Self {
            group_folder,
            is_main,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_detects_main() {
        assert!(IpcSource::new("main", "main").is_main);
        assert!(!IpcSource::new("team-a", "main").is_main);
    }

    #[test]
    fn parse_message() {
        let json = r#"{
            "type": "message",
            "chatJid": "team-a",
            "text": "Build finished",
            "groupFolder": "main",
            "timestamp": "2026-08-01T12:00:00Z"
        }"#;
        let msg: IpcMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.msg_type, "message");
        assert_eq!(msg.chat_jid, "team-a");
        assert_eq!(msg.text, "Build finished");
    }

    #[test]
    fn parse_schedule_task() {
        let json = r#"{
            "type": "schedule_task",
            "prompt": "Check build status",
            "schedule_type": "cron",
            "schedule_value": "*/5 * * * *",
            "targetJid": "main"
        }"#;
        let op: IpcTaskOp = serde_json::from_str(json).unwrap();
        match op {
            IpcTaskOp::ScheduleTask {
                prompt,
                schedule_type,
                context_mode,
                target_jid,
                ..
            } => {
                assert_eq!(prompt, "Check build status");
                assert_eq!(schedule_type, "cron");
                assert_eq!(context_mode, "isolated");
                assert_eq!(target_jid.as_deref(), Some("main"));
            }
            other => panic!("expected schedule_task, got {other:?}"),
        }
    }

    #[test]
    fn parse_cancel_task() {
        let op: IpcTaskOp =
            serde_json::from_str(r#"{"type":"cancel_task","taskId":"t-42"}"#).unwrap();
        match op {
            IpcTaskOp::CancelTask { task_id, .. } => assert_eq!(task_id, "t-42"),
            other => panic!("expected cancel_task, got {other:?}"),
        }
    }

    #[test]
    fn parse_register_group() {
        let json = r#"{
            "type": "register_group",
            "jid": "Team B",
            "name": "Team B",
            "folder": "team-b",
            "trigger": "@Hearth"
        }"#;
        let op: IpcTaskOp = serde_json::from_str(json).unwrap();
        match op {
            IpcTaskOp::RegisterGroup { jid, name, .. } => {
                assert_eq!(jid, "Team B");
                assert_eq!(name, "Team B");
            }
            other => panic!("expected register_group, got {other:?}"),
        }
    }
}
