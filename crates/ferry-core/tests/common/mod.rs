//! Two hosts talking over loopback TCP

#![allow(dead_code)]

use ferry_core::{Catalog, ConfigContext, FerryCore, MemoryTaskStore};
use ferry_types::{CoreEvent, Direction, HostAuth, Role, Rule, Settings, TaskKey};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const ALPHA_KEY: &str = "alpha-secret";
pub const BETA_KEY: &str = "beta-secret";

pub struct Host {
    pub core: FerryCore,
    pub root: PathBuf,
}

impl Host {
    pub fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    pub fn in_dir(&self) -> PathBuf {
        self.root.join("in")
    }

    pub fn write_out(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.out_dir().join(name);
        std::fs::create_dir_all(self.out_dir()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }
}

pub struct Pair {
    pub alpha: Host,
    pub beta: Host,
    _dir: TempDir,
}

pub fn rules() -> Vec<Rule> {
    vec![Rule::new("push", Direction::Send), Rule::new("pull", Direction::Recv)]
}

fn settings(host_id: &str, root: &Path, max_concurrent: u32) -> Settings {
    Settings {
        host_id: host_id.to_string(),
        listen_address: "127.0.0.1:0".to_string(),
        connection_timeout_ms: 3_000,
        idle_timeout_ms: 10_000,
        min_blocksize: 64,
        default_blocksize: 1024,
        max_concurrent_transfers: max_concurrent,
        commander_interval_ms: 50,
        in_dir: root.join("in"),
        out_dir: root.join("out"),
        work_dir: root.join("work"),
        retry: ferry_types::RetrySettings {
            max_attempts: 2,
            base_delay_ms: 50,
            max_delay_ms: 200,
        },
        ..Settings::default()
    }
}

fn alpha_entry(key: &str) -> HostAuth {
    HostAuth::new("alpha", "127.0.0.1", 1, key).with_roles(&[Role::Transfer, Role::Read, Role::Control])
}

/// `beta` listens, `alpha` requests. `beta` knows alpha under
/// `alpha_key_on_beta`, so a wrong value makes authentication fail.
pub async fn pair_with(max_concurrent: u32, alpha_key_on_beta: &str) -> Pair {
    let dir = tempfile::tempdir().unwrap();
    let alpha_root = dir.path().join("alpha");
    let beta_root = dir.path().join("beta");

    let beta = FerryCore::with_parts(
        ConfigContext::new(settings("beta", &beta_root, max_concurrent)),
        Arc::new(MemoryTaskStore::new()),
        Catalog::in_memory(
            rules(),
            vec![alpha_entry(alpha_key_on_beta), HostAuth::new("beta", "127.0.0.1", 1, BETA_KEY)],
        ),
    );
    let address = beta.start_listener().await.unwrap();

    let alpha = FerryCore::with_parts(
        ConfigContext::new(settings("alpha", &alpha_root, max_concurrent)),
        Arc::new(MemoryTaskStore::new()),
        Catalog::in_memory(
            rules(),
            vec![
                alpha_entry(ALPHA_KEY),
                HostAuth::new("beta", "127.0.0.1", address.port(), BETA_KEY),
            ],
        ),
    );
    beta.catalog()
        .save_host(HostAuth::new("beta", "127.0.0.1", address.port(), BETA_KEY))
        .await
        .unwrap();

    Pair {
        alpha: Host {
            core: alpha,
            root: alpha_root,
        },
        beta: Host {
            core: beta,
            root: beta_root,
        },
        _dir: dir,
    }
}

pub async fn pair(max_concurrent: u32) -> Pair {
    pair_with(max_concurrent, ALPHA_KEY).await
}

/// Deterministic, non-repeating content
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Wait for the first event matching `pick`
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<CoreEvent>,
    mut pick: impl FnMut(&CoreEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no matching event")
}

/// Wait until the transfer with `key` reached block `rank`
pub async fn progress_reaches(events: &mut broadcast::Receiver<CoreEvent>, key: &TaskKey, rank: u64) {
    next_event(events, |event| match event {
        CoreEvent::TransferProgress { key: k, rank: r, .. } if k == key && *r >= rank => Some(()),
        _ => None,
    })
    .await
}
