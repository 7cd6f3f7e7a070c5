//! Rules and host credentials, kept as JSON files under the data directory

use crate::error::{FerryError, Result};
use ferry_types::{HostAuth, Rule};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::warn;

/// Lookup tables for rules and hosts
///
/// Reads are served from memory. Writes go to memory and, when the catalog
/// is backed by a directory, to `rules/<id>.json` or `hosts/<id>.json`.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    data_dir: Option<PathBuf>,
    rules: Arc<RwLock<HashMap<String, Rule>>>,
    hosts: Arc<RwLock<HashMap<String, HostAuth>>>,
}

impl Catalog {
    /// Load every rule and host found under `data_dir`
    pub async fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir.join("rules")).await?;
        fs::create_dir_all(data_dir.join("hosts")).await?;

        let rules: Vec<Rule> = load_dir(&data_dir.join("rules")).await?;
        let hosts: Vec<HostAuth> = load_dir(&data_dir.join("hosts")).await?;

        Ok(Self {
            data_dir: Some(data_dir.to_path_buf()),
            rules: Arc::new(RwLock::new(rules.into_iter().map(|r| (r.id.clone(), r)).collect())),
            hosts: Arc::new(RwLock::new(
                hosts.into_iter().map(|h| (h.host_id.clone(), h)).collect(),
            )),
        })
    }

    /// Catalog living only in memory
    pub fn in_memory(rules: Vec<Rule>, hosts: Vec<HostAuth>) -> Self {
        Self {
            data_dir: None,
            rules: Arc::new(RwLock::new(rules.into_iter().map(|r| (r.id.clone(), r)).collect())),
            hosts: Arc::new(RwLock::new(
                hosts.into_iter().map(|h| (h.host_id.clone(), h)).collect(),
            )),
        }
    }

    // ========================================================================
    // Rules
    // ========================================================================

    pub fn rule(&self, id: &str) -> Result<Rule> {
        self.rules
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FerryError::NotFound(format!("rule {id}")))
    }

    pub fn rules(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub async fn save_rule(&self, rule: Rule) -> Result<()> {
        if let Some(dir) = &self.data_dir {
            write_json(&dir.join("rules").join(format!("{}.json", rule.id)), &rule).await?;
        }
        self.rules.write().insert(rule.id.clone(), rule);
        Ok(())
    }

    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        if let Some(dir) = &self.data_dir {
            remove_if_exists(&dir.join("rules").join(format!("{id}.json"))).await?;
        }
        self.rules.write().remove(id);
        Ok(())
    }

    // ========================================================================
    // Hosts
    // ========================================================================

    pub fn host(&self, id: &str) -> Result<HostAuth> {
        self.hosts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| FerryError::NotFound(format!("host {id}")))
    }

    pub fn hosts(&self) -> Vec<HostAuth> {
        let mut hosts: Vec<HostAuth> = self.hosts.read().values().cloned().collect();
        hosts.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        hosts
    }

    pub async fn save_host(&self, host: HostAuth) -> Result<()> {
        if let Some(dir) = &self.data_dir {
            write_json(&dir.join("hosts").join(format!("{}.json", host.host_id)), &host).await?;
        }
        self.hosts.write().insert(host.host_id.clone(), host);
        Ok(())
    }

    pub async fn delete_host(&self, id: &str) -> Result<()> {
        if let Some(dir) = &self.data_dir {
            remove_if_exists(&dir.join("hosts").join(format!("{id}.json"))).await?;
        }
        self.hosts.write().remove(id);
        Ok(())
    }
}

async fn load_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    if !dir.exists() {
        return Ok(items);
    }

    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<T>(&content) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping unreadable {}: {}", path.display(), e),
            }
        }
    }
    Ok(items)
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::Direction;

    #[tokio::test]
    async fn rules_and_hosts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).await.unwrap();
        catalog.save_rule(Rule::new("out", Direction::Send)).await.unwrap();
        catalog
            .save_host(HostAuth::new("peer", "127.0.0.1", 6666, "secret"))
            .await
            .unwrap();

        let reopened = Catalog::open(dir.path()).await.unwrap();
        assert_eq!(reopened.rule("out").unwrap().direction, Direction::Send);
        assert_eq!(reopened.host("peer").unwrap().key, "secret");

        reopened.delete_rule("out").await.unwrap();
        assert!(matches!(reopened.rule("out"), Err(FerryError::NotFound(_))));
        assert!(Catalog::open(dir.path()).await.unwrap().rules().is_empty());
    }

    #[test]
    fn in_memory_catalog_skips_disk() {
        let catalog = Catalog::in_memory(vec![Rule::new("in", Direction::Recv)], Vec::new());
        tokio_test::block_on(async {
            tokio_test::assert_ok!(catalog.save_host(HostAuth::new("peer", "10.0.0.2", 6666, "k")).await);
            tokio_test::assert_ok!(catalog.delete_rule("in").await);
        });
        tokio_test::assert_ok!(catalog.host("peer"));
        tokio_test::assert_err!(catalog.rule("in"));
    }
}
