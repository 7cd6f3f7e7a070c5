//! Out-of-band control requests
//!
//! The passive side answers them in [`answer`]. A local client sends them
//! with [`request`] over a fresh channel.

use crate::context::EngineContext;
use crate::error::{FerryError, Result};
use ferry_types::{BandwidthLimit, ErrorCode, FileEntry, HostAuth, Rule, TaskKey};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use super::active::Abort;
use super::auth;
use super::data;
use super::fsm::ChannelState;
use super::packet::{
    BandwidthPacket, BusinessPacket, Flag, InfoKind, InformationPacket, KeyedControl, Packet, TestPacket, Valid,
};
use super::connection::Channel;
use super::requester;

/// Serve one control packet received from `peer`
pub(crate) async fn answer(engine: &EngineContext, channel: &mut Channel, peer: &HostAuth, packet: Packet) -> Result<()> {
    let kind = packet.kind();
    if let Some(role) = auth::required_role(kind) {
        if !peer.has_role(role) {
            debug!("{} lacks {:?} for {:?}", peer.host_id, role, kind);
            return channel
                .send(&Packet::error(
                    ErrorCode::BadAuthent,
                    format!("{} may not send {:?}", peer.host_id, kind),
                ))
                .await;
        }
    }

    let reply = match packet {
        Packet::KeepAlive(Flag { value: false }) => {
            return channel.send(&Packet::KeepAlive(Flag { value: true })).await;
        }
        Packet::Test(test) => {
            return channel
                .send(&Packet::Test(TestPacket {
                    message: test.message,
                    answer: true,
                }))
                .await;
        }
        Packet::Stop(KeyedControl { key }) => abort(engine, &key, Abort::Stop).await,
        Packet::Cancel(KeyedControl { key }) => abort(engine, &key, Abort::Cancel).await,
        Packet::Bandwidth(BandwidthPacket { set }) => {
            if let Some(limit) = set {
                info!("{} changed bandwidth limits", peer.host_id);
                engine.change_bandwidth(limit);
            }
            serde_json::to_string(&engine.limiter.limits()).map_err(FerryError::from)
        }
        Packet::Block(Flag { value }) => {
            engine.network.set_blocked(value);
            Ok(value.to_string())
        }
        Packet::Shutdown(Flag { value }) => {
            info!("{} asked this host to shut down", peer.host_id);
            channel
                .send(&Packet::Valid(Valid {
                    code: ErrorCode::CompleteOk,
                    info: "shutting down".into(),
                }))
                .await?;
            channel.set_state(ChannelState::Close);
            engine.request_shutdown(value);
            return Ok(());
        }
        Packet::Information(request) => information(engine, &request).await,
        Packet::Business(BusinessPacket { name, args }) => match engine.business.get(&name) {
            Some(handler) => handler.handle(engine, peer, &args).await,
            None => Err(FerryError::refused(
                ErrorCode::CommandNotFound,
                format!("no business handler named {name}"),
            )),
        },
        other => Err(FerryError::refused(
            ErrorCode::IncorrectCommand,
            format!("{:?} is not a control request", other.kind()),
        )),
    };

    let packet = match reply {
        Ok(info) => Packet::Valid(Valid {
            code: ErrorCode::CompleteOk,
            info,
        }),
        Err(e) => Packet::error(e.code(), e.to_string()),
    };
    channel.send(&packet).await
}

async fn abort(engine: &EngineContext, key: &TaskKey, reason: Abort) -> Result<String> {
    let runner = engine.abort_transfer(key, reason).await?;
    Ok(serde_json::to_string(&runner)?)
}

async fn information(engine: &EngineContext, request: &InformationPacket) -> Result<String> {
    let name = request.filename.as_deref().unwrap_or("*");
    match request.kind {
        InfoKind::Transfer => {
            let key = request
                .key
                .as_ref()
                .ok_or_else(|| FerryError::refused(ErrorCode::IncorrectCommand, "transfer query needs a key"))?;
            let runner = engine.repo.get(key).await?;
            Ok(serde_json::to_string(&runner)?)
        }
        InfoKind::Exist => {
            let (_, dir) = listing(engine, request)?;
            let exists = fs::metadata(dir.join(basename(name)))
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            Ok(exists.to_string())
        }
        InfoKind::List => {
            let (rule, dir) = listing(engine, request)?;
            let names: Vec<String> = list(&dir, &rule, name).await?.into_iter().map(|e| e.name).collect();
            Ok(serde_json::to_string(&names)?)
        }
        InfoKind::MlsList => {
            let (rule, dir) = listing(engine, request)?;
            Ok(serde_json::to_string(&list(&dir, &rule, name).await?)?)
        }
        InfoKind::MlsDetail => {
            let (_, dir) = listing(engine, request)?;
            let path = dir.join(basename(name));
            let entry = entry(&path)
                .await
                .ok_or_else(|| FerryError::FileNotFound(path.clone()))?;
            Ok(serde_json::to_string(&entry)?)
        }
    }
}

fn listing(engine: &EngineContext, request: &InformationPacket) -> Result<(Rule, PathBuf)> {
    let rule = engine.catalog.rule(&request.rule_id).map_err(|_| {
        FerryError::refused(
            ErrorCode::QueryRemotelyUnknown,
            format!("unknown rule {}", request.rule_id),
        )
    })?;
    let dir = engine.listing_dir(&rule);
    Ok((rule, dir))
}

/// Files of `dir` whose name matches the glob `pattern`
async fn list(dir: &Path, rule: &Rule, pattern: &str) -> Result<Vec<FileEntry>> {
    let matcher = glob(basename(pattern))?;
    let mut entries = Vec::new();
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Listing dir {} of rule {} does not exist", dir.display(), rule.id);
            return Ok(entries);
        }
        Err(e) => return Err(e.into()),
    };
    while let Some(item) = reader.next_entry().await? {
        let name = item.file_name().to_string_lossy().into_owned();
        if !matcher.is_match(&name) {
            continue;
        }
        if let Some(entry) = entry(&item.path()).await {
            entries.push(entry);
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

async fn entry(path: &Path) -> Option<FileEntry> {
    let meta = fs::metadata(path).await.ok().filter(|m| m.is_file())?;
    Some(FileEntry {
        name: path.file_name()?.to_string_lossy().into_owned(),
        size: meta.len(),
        modified: meta.modified().ok().map(Into::into),
    })
}

/// Translate a `*` / `?` pattern into an anchored regex
fn glob(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| FerryError::refused(ErrorCode::IncorrectCommand, format!("bad pattern: {e}")))
}

fn basename(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name)
}

// ============================================================================
// Client side
// ============================================================================

/// Control request a local client can send to a remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Stop(TaskKey),
    Cancel(TaskKey),
    /// `None` only queries the current limits
    Bandwidth(Option<BandwidthLimit>),
    Shutdown { restart: bool },
    Block(bool),
    Test(String),
    Information {
        kind: InfoKind,
        rule_id: String,
        filename: Option<String>,
        key: Option<TaskKey>,
    },
    Business { name: String, args: String },
    KeepAlive,
}

impl ControlRequest {
    fn packet(&self) -> Packet {
        match self {
            ControlRequest::Stop(key) => Packet::Stop(KeyedControl { key: key.clone() }),
            ControlRequest::Cancel(key) => Packet::Cancel(KeyedControl { key: key.clone() }),
            ControlRequest::Bandwidth(set) => Packet::Bandwidth(BandwidthPacket { set: *set }),
            ControlRequest::Shutdown { restart } => Packet::Shutdown(Flag { value: *restart }),
            ControlRequest::Block(value) => Packet::Block(Flag { value: *value }),
            ControlRequest::Test(message) => Packet::Test(TestPacket {
                message: message.clone(),
                answer: false,
            }),
            ControlRequest::Information {
                kind,
                rule_id,
                filename,
                key,
            } => Packet::Information(InformationPacket {
                kind: *kind,
                rule_id: rule_id.clone(),
                filename: filename.clone(),
                key: key.clone(),
            }),
            ControlRequest::Business { name, args } => Packet::Business(BusinessPacket {
                name: name.clone(),
                args: args.clone(),
            }),
            ControlRequest::KeepAlive => Packet::KeepAlive(Flag { value: false }),
        }
    }
}

/// What the remote host answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlReply {
    pub code: ErrorCode,
    pub info: String,
}

/// Send `request` to `host` and wait for its answer
pub async fn request(engine: &EngineContext, host: &HostAuth, request: ControlRequest) -> Result<ControlReply> {
    let (mut channel, _) = requester::connect(engine, host).await?;
    channel.send(&request.packet()).await?;

    let reply = match data::receive(&mut channel, engine.config.idle_timeout()).await? {
        Packet::Valid(valid) => ControlReply {
            code: valid.code,
            info: valid.info,
        },
        Packet::Test(test) if test.answer => ControlReply {
            code: ErrorCode::CompleteOk,
            info: test.message,
        },
        Packet::KeepAlive(Flag { value: true }) => ControlReply {
            code: ErrorCode::CompleteOk,
            info: String::new(),
        },
        other => {
            let e = FerryError::Protocol(format!("unexpected answer {:?}", other.kind()));
            channel.fail(&e).await;
            return Err(e);
        }
    };
    debug!("{} answered {:?}", host.host_id, reply.code);
    channel.set_state(ChannelState::Close);
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::PacketType;

    #[test]
    fn glob_patterns_are_anchored() {
        let m = glob("*.csv").unwrap();
        assert!(m.is_match("a.csv"));
        assert!(!m.is_match("a.csv.part"));
        let m = glob("report-??.txt").unwrap();
        assert!(m.is_match("report-01.txt"));
        assert!(!m.is_match("report-1.txt"));
        assert!(glob("a+b(c).txt").unwrap().is_match("a+b(c).txt"));
    }

    #[tokio::test]
    async fn listing_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.csv"), b"12345").await.unwrap();
        fs::write(dir.path().join("a.csv"), b"1").await.unwrap();
        fs::write(dir.path().join("c.txt"), b"1").await.unwrap();
        fs::create_dir(dir.path().join("d.csv")).await.unwrap();

        let rule = Rule::new("r", ferry_types::Direction::Recv);
        let entries = list(dir.path(), &rule, "*.csv").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.csv", "b.csv"]);
        assert_eq!(entries[1].size, 5);

        let missing = list(&dir.path().join("nope"), &rule, "*").await.unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn requests_map_to_their_packets() {
        let key = TaskKey::new(3, "a", "b");
        assert_eq!(ControlRequest::Stop(key.clone()).packet().kind(), PacketType::Stop);
        assert_eq!(
            ControlRequest::Shutdown { restart: true }.packet(),
            Packet::Shutdown(Flag { value: true })
        );
        assert_eq!(ControlRequest::KeepAlive.packet(), Packet::KeepAlive(Flag { value: false }));
    }
}
