//! Group identity and metadata.
//!
//! A group id doubles as its on-disk folder name, so normalization is the
//! single gate between untrusted input and the filesystem.

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// A named execution context with its own folder, session, and container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    /// Normalized routing key. Equal to `folder` by construction.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    pub folder: String,
    /// Informational trigger string carried from registration.
    pub trigger: String,
    pub added_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<GroupContainerConfig>,
}

/// Optional per-group container overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupContainerConfig {
    pub image: Option<String>,
    pub additional_mounts: Vec<MountSpec>,
    /// Names of host environment variables forwarded into the container.
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Normalize a raw group identifier into the canonical routing key / folder
/// name: lowercase, `[a-z0-9_-]` only, dash runs collapsed, edge dashes
/// trimmed. Rejects anything that would not be a safe directory name.
pub fn normalize_group_id(raw: &str) -> anyhow::Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;

    for c in raw.trim().chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_alphanumeric() || c == '_' {
            last_dash = false;
            c
        } else if last_dash {
            continue;
        } else {
            last_dash = true;
            '-'
        };
        out.push(mapped);
    }

    let normalized = out.trim_matches('-').to_string();
    if normalized.is_empty() || normalized == "." || normalized == ".." {
        bail!("invalid group id: {raw:?}");
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_spaces_and_case() {
        assert_eq!(normalize_group_id("Team A").unwrap(), "team-a");
        assert_eq!(normalize_group_id("Family Chat!!").unwrap(), "family-chat");
    }

    #[test]
    fn collapses_dash_runs_and_trims() {
        assert_eq!(normalize_group_id("--a///b--").unwrap(), "a-b");
        assert_eq!(normalize_group_id("a - - b").unwrap(), "a-b");
    }

    #[test]
    fn keeps_underscores() {
        assert_eq!(normalize_group_id("team_eng").unwrap(), "team_eng");
    }

    #[test]
    fn rejects_empty_and_dots() {
        assert!(normalize_group_id("").is_err());
        assert!(normalize_group_id("///").is_err());
        assert!(normalize_group_id("..").is_err());
        // "." normalizes to "-" which trims to empty
        assert!(normalize_group_id(".").is_err());
    }

    #[test]
    fn idempotent() {
        for raw in ["Team A", "a--b", "MAIN", "x_y-z", "já pô"] {
            let once = normalize_group_id(raw).unwrap();
            let twice = normalize_group_id(&once).unwrap();
            assert_eq!(once, twice, "normalization not idempotent for {raw:?}");
        }
    }

    #[test]
    fn container_config_parses_camel_case() {
        let json = r#"{
            "image": "custom-agent:1",
            "additionalMounts": [
                {"hostPath": "/srv/docs", "containerPath": "/workspace/docs", "readonly": true}
            ],
            "env": ["OPENAI_API_KEY"]
        }"#;
        let cfg: GroupContainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.image.as_deref(), Some("custom-agent:1"));
        assert_eq!(cfg.additional_mounts.len(), 1);
        assert!(cfg.additional_mounts[0].readonly);
        assert_eq!(cfg.env, vec!["OPENAI_API_KEY"]);
    }
}
