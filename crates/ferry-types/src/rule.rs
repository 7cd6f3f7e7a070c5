//! Transfer rules and peer identities.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::settings::BandwidthLimit;

// ============================================================================
// Rules
// ============================================================================

/// Which side pushes the file, seen from the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The requester sends the file to the requested host.
    Send,
    /// The requester pulls the file from the requested host.
    Recv,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMode {
    #[default]
    Direct,
    SendThrough,
    RecvThrough,
}

impl TransferMode {
    /// Through modes stream data and cannot resume at a rank.
    pub fn is_through(self) -> bool {
        !matches!(self, TransferMode::Direct)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Direct => "direct",
            TransferMode::SendThrough => "send-through",
            TransferMode::RecvThrough => "recv-through",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(TransferMode::Direct),
            "send-through" => Some(TransferMode::SendThrough),
            "recv-through" => Some(TransferMode::RecvThrough),
            _ => None,
        }
    }
}

/// What happens when a task hook fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPolicy {
    /// Log and carry on.
    Warning,
    /// Abort the transfer.
    #[default]
    Error,
}

/// One hook invocation inside a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTask {
    /// Registered hook name (LOG, EXEC, MOVE, ...).
    pub kind: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub policy: TaskPolicy,
    /// Zero means no limit.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl RuleTask {
    pub fn new(kind: impl Into<String>, args: impl Into<String>, policy: TaskPolicy) -> Self {
        Self {
            kind: kind.into(),
            args: args.into(),
            policy,
            timeout_ms: 0,
        }
    }
}

/// Named policy shared by peers under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub direction: Direction,
    #[serde(default)]
    pub mode: TransferMode,
    /// Hosts allowed to use this rule. Empty means everyone.
    #[serde(default)]
    pub host_ids: Vec<String>,
    #[serde(default)]
    pub recv_path: Option<PathBuf>,
    #[serde(default)]
    pub send_path: Option<PathBuf>,
    #[serde(default)]
    pub work_path: Option<PathBuf>,
    #[serde(default)]
    pub pre_tasks: Vec<RuleTask>,
    /// Run on the receiver right after the file is in place.
    #[serde(default)]
    pub transfer_tasks: Vec<RuleTask>,
    #[serde(default)]
    pub post_tasks: Vec<RuleTask>,
    #[serde(default)]
    pub error_tasks: Vec<RuleTask>,
    #[serde(default)]
    pub bandwidth: Option<BandwidthLimit>,
}

impl Rule {
    pub fn new(id: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: id.into(),
            direction,
            mode: TransferMode::Direct,
            host_ids: Vec::new(),
            recv_path: None,
            send_path: None,
            work_path: None,
            pre_tasks: Vec::new(),
            transfer_tasks: Vec::new(),
            post_tasks: Vec::new(),
            error_tasks: Vec::new(),
            bandwidth: None,
        }
    }

    pub fn allows_host(&self, host_id: &str) -> bool {
        self.host_ids.is_empty() || self.host_ids.iter().any(|h| h == host_id)
    }
}

// ============================================================================
// Hosts
// ============================================================================

/// What an authenticated peer may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Transfer,
    Control,
    Read,
    System,
    Business,
}

/// Identity and credentials of a peer (or of this host).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAuth {
    pub host_id: String,
    pub address: String,
    pub port: u16,
    /// Shared secret.
    pub key: String,
    #[serde(default)]
    pub is_ssl: bool,
    /// Client-only hosts never accept connections.
    #[serde(default)]
    pub is_client: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_roles")]
    pub roles: Vec<Role>,
}

fn default_true() -> bool {
    true
}

fn default_roles() -> Vec<Role> {
    vec![Role::Transfer, Role::Read]
}

impl HostAuth {
    pub fn new(host_id: impl Into<String>, address: impl Into<String>, port: u16, key: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            address: address.into(),
            port,
            key: key.into(),
            is_ssl: false,
            is_client: false,
            is_active: true,
            roles: default_roles(),
        }
    }

    pub fn with_roles(mut self, roles: &[Role]) -> Self {
        self.roles = roles.to_vec();
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role) || self.roles.contains(&Role::System)
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_role_implies_everything() {
        let host = HostAuth::new("h", "127.0.0.1", 6666, "k").with_roles(&[Role::System]);
        assert!(host.has_role(Role::Control));
        assert!(host.has_role(Role::Transfer));

        let plain = HostAuth::new("h", "127.0.0.1", 6666, "k");
        assert!(plain.has_role(Role::Transfer));
        assert!(!plain.has_role(Role::Control));
    }

    #[test]
    fn rule_defaults_from_minimal_json() {
        let rule: Rule = serde_json::from_str(r#"{"id":"out","direction":"send"}"#).unwrap();
        assert_eq!(rule.mode, TransferMode::Direct);
        assert!(rule.allows_host("anyone"));
        assert!(rule.pre_tasks.is_empty());
    }
}
