//! Group registry: in-memory map of registered groups with write-through to
//! the store. Registration also creates the group's working folder and its
//! logs directory.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use hearth_core::{normalize_group_id, now_iso, GroupContainerConfig, RegisteredGroup, Store};
use tokio::sync::RwLock;
use tracing::info;

pub struct GroupRegistry {
    groups: RwLock<HashMap<String, RegisteredGroup>>,
    store: Store,
    groups_dir: PathBuf,
}

impl GroupRegistry {
    /// Rehydrate the registry from the store.
    pub async fn load(store: Store, groups_dir: PathBuf) -> anyhow::Result<Self> {
        let mut groups = HashMap::new();
        for group in store.all_registered_groups().await? {
            groups.insert(group.id.clone(), group);
        }
        info!(count = groups.len(), "group registry rehydrated");
        Ok(Self {
            groups: RwLock::new(groups),
            store,
            groups_dir,
        })
    }

    pub async fn get(&self, group_id: &str) -> Option<RegisteredGroup> {
        self.groups.read().await.get(group_id).cloned()
    }

    pub async fn exists(&self, group_id: &str) -> bool {
        self.groups.read().await.contains_key(group_id)
    }

    pub async fn list(&self) -> Vec<RegisteredGroup> {
        let mut groups: Vec<_> = self.groups.read().await.values().cloned().collect();
        groups.sort_by(|a, b| a.added_at.cmp(&b.added_at));
        groups
    }

    /// Register a group under its normalized id. Idempotent: an existing
    /// registration is left untouched and returned.
    pub async fn register(
        &self,
        raw_id: &str,
        name: &str,
        trigger: &str,
        container_config: Option<GroupContainerConfig>,
    ) -> anyhow::Result<RegisteredGroup> {
        let id = normalize_group_id(raw_id)?;

        {
            let groups = self.groups.read().await;
            if let Some(existing) = groups.get(&id) {
                return Ok(existing.clone());
            }
        }

        let group = RegisteredGroup {
            id: id.clone(),
            name: name.to_string(),
            folder: id.clone(),
            trigger: trigger.to_string(),
            added_at: now_iso(),
            container_config,
        };

        let logs_dir = self.groups_dir.join(&group.folder).join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("failed to create {}", logs_dir.display()))?;

        self.store.set_registered_group(&group).await?;

        let mut groups = self.groups.write().await;
        let entry = groups.entry(id).or_insert(group);
        info!(group_id = entry.id.as_str(), name = entry.name.as_str(), "group registered");
        Ok(entry.clone())
    }

    /// Auto-registration for first-seen chat targets. `raw` keeps its
    /// original casing as the display name.
    pub async fn ensure_registered(&self, raw: &str) -> anyhow::Result<RegisteredGroup> {
        let id = normalize_group_id(raw)?;
        if let Some(existing) = self.get(&id).await {
            return Ok(existing);
        }
        self.register(&id, raw.trim(), "", None).await
    }

    /// Guarantee the distinguished main group exists.
    pub async fn ensure_main(&self, main_folder: &str) -> anyhow::Result<RegisteredGroup> {
        if let Some(existing) = self.get(main_folder).await {
            return Ok(existing);
        }
        self.register(main_folder, "Main", "", None).await
    }
}
