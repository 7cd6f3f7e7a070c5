//! Passive side: serves channels opened by remote hosts

use crate::context::EngineContext;
use crate::error::{FerryError, Result};
use crate::transfer;
use ferry_types::{CoreEvent, ErrorCode, GlobalStep, HostAuth, Role, Rule, TaskRunner, TransferResult, UpdatedInfo};
use tracing::{debug, info, warn};

use super::active::{ActiveGuard, ChannelControl};
use super::auth;
use super::block::BlockOptions;
use super::connection::{Channel, ChannelAcceptor};
use super::control;
use super::data::{self, DataSession};
use super::fsm::ChannelState;
use super::packet::{Authent, EndRequest, Packet, TransferRequest, PROTOCOL_VERSION};

/// Hands every accepted channel to its own task
#[derive(Clone, Debug)]
pub struct Responder {
    engine: EngineContext,
}

impl Responder {
    pub fn new(engine: EngineContext) -> Self {
        Self { engine }
    }
}

impl ChannelAcceptor for Responder {
    fn accept(&self, channel: Channel) {
        let engine = self.engine.clone();
        tokio::spawn(async move { serve(engine, channel).await });
    }
}

async fn serve(engine: EngineContext, mut channel: Channel) {
    let (peer, caps) = match authenticate(&engine, &mut channel).await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("Refused channel from {}: {}", channel.peer(), e);
            channel.fail(&e).await;
            return;
        }
    };

    let packet = match data::receive(&mut channel, engine.config.connection_timeout()).await {
        Ok(packet) => packet,
        Err(e) => {
            debug!("Channel {} from {} ended: {}", channel.id(), peer.host_id, e);
            channel.fail(&e).await;
            return;
        }
    };

    match packet {
        Packet::Request(request) => serve_transfer(&engine, &mut channel, &peer, caps, request).await,
        packet => {
            if let Err(e) = control::answer(&engine, &mut channel, &peer, packet).await {
                channel.fail(&e).await;
            }
        }
    }
}

async fn authenticate(engine: &EngineContext, channel: &mut Channel) -> Result<(HostAuth, BlockOptions)> {
    let ip = channel.peer().ip().to_string();
    let hello = match data::receive(channel, engine.config.connection_timeout()).await? {
        Packet::Authent(hello) if !hello.answer => hello,
        other => {
            return Err(FerryError::Protocol(format!(
                "expected AUTHENT, got {:?}",
                other.kind()
            )))
        }
    };

    let local = engine.local_host()?;
    if hello.host_id == local.host_id {
        return Err(FerryError::refused(
            ErrorCode::LoopSelfRequestedHost,
            "a host cannot connect to itself",
        ));
    }
    let peer = match engine.catalog.host(&hello.host_id) {
        Ok(host) if host.is_active => host,
        _ => {
            engine.network.record_auth_failure(&ip);
            return Err(FerryError::Authentication(format!(
                "{} from {} is not a known host",
                hello.host_id, ip
            )));
        }
    };
    if hello.version != PROTOCOL_VERSION {
        return Err(FerryError::Protocol(format!(
            "{} speaks protocol {}, we speak {}",
            peer.host_id, hello.version, PROTOCOL_VERSION
        )));
    }

    let settings = engine.config.snapshot();
    let challenge = auth::nonce();
    channel
        .send(&Packet::Authent(Authent {
            host_id: local.host_id.clone(),
            nonce: challenge.clone(),
            proof: auth::proof(&local.host_id, &local.key, &hello.nonce),
            version: PROTOCOL_VERSION,
            use_compression: settings.use_compression,
            use_block_digest: settings.use_block_digest,
            answer: true,
        }))
        .await?;

    let reply = match data::receive(channel, engine.config.connection_timeout()).await? {
        Packet::Authent(reply) if !reply.answer => reply,
        other => {
            return Err(FerryError::Protocol(format!(
                "expected AUTHENT proof, got {:?}",
                other.kind()
            )))
        }
    };
    if reply.host_id != peer.host_id || !auth::verify(&peer, &challenge, &reply.proof) {
        engine.network.record_auth_failure(&ip);
        return Err(FerryError::Authentication(format!(
            "{} from {} not authenticated",
            hello.host_id, ip
        )));
    }
    engine.network.blacklist().clear(&ip);
    debug!("Accepted {} on channel {}", peer.host_id, channel.id());

    Ok((
        peer,
        BlockOptions {
            compression: settings.use_compression && hello.use_compression,
            block_digest: settings.use_block_digest && hello.use_block_digest,
        },
    ))
}

async fn serve_transfer(
    engine: &EngineContext,
    channel: &mut Channel,
    peer: &HostAuth,
    caps: BlockOptions,
    request: TransferRequest,
) {
    let key = request.key();
    let admitted = match admit(engine, peer, &request).await {
        Ok((rule, guard)) => load_runner(engine, &rule, &request)
            .await
            .map(|runner| (rule, guard, runner)),
        Err(e) => Err(e),
    };
    let (rule, guard, runner) = match admitted {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!("Refused transfer {} from {}: {}", key, peer.host_id, e);
            channel.fail(&e).await;
            return;
        }
    };

    match run(engine, channel, peer, caps, &request, &rule, runner, guard.control()).await {
        Ok(runner) => {
            info!("Transfer {} from {} done", key, peer.host_id);
            let result = TransferResult::from_runner(runner, 1);
            engine.emit(CoreEvent::TransferCompleted { result: result.clone() });
            engine.completions.complete(&result);
        }
        Err(e) => {
            channel.fail(&e).await;
            let result = transfer::fail(engine, &key, &e, 1).await;
            engine.emit(CoreEvent::TransferCompleted { result: result.clone() });
            engine.completions.complete(&result);
        }
    }
    drop(guard);
}

/// Checks done before any row is touched
async fn admit(engine: &EngineContext, peer: &HostAuth, request: &TransferRequest) -> Result<(Rule, ActiveGuard)> {
    if !peer.has_role(Role::Transfer) {
        return Err(FerryError::refused(
            ErrorCode::BadAuthent,
            format!("{} may not transfer", peer.host_id),
        ));
    }
    if engine.network.is_blocked() {
        return Err(FerryError::refused(ErrorCode::ServerOverloaded, "new requests are blocked"));
    }
    if engine.shutdown.is_cancelled() {
        return Err(FerryError::Shutdown);
    }
    if request.requester != peer.host_id {
        return Err(FerryError::refused(
            ErrorCode::BadAuthent,
            format!("{} cannot request on behalf of {}", peer.host_id, request.requester),
        ));
    }
    let local = engine.config.host_id();
    if request.requested != local {
        return Err(FerryError::refused(
            ErrorCode::NotKnownHost,
            format!("this host is {local}, not {}", request.requested),
        ));
    }

    let rule = engine
        .catalog
        .rule(&request.rule_id)
        .map_err(|_| FerryError::refused(ErrorCode::QueryRemotelyUnknown, format!("unknown rule {}", request.rule_id)))?;
    if !rule.allows_host(&peer.host_id) {
        return Err(FerryError::refused(
            ErrorCode::FileNotAllowed,
            format!("rule {} is not open to {}", rule.id, peer.host_id),
        ));
    }
    if rule.mode != request.mode {
        return Err(FerryError::refused(
            ErrorCode::IncorrectCommand,
            format!("rule {} is {}, request asks for {}", rule.id, rule.mode.as_str(), request.mode.as_str()),
        ));
    }

    // A previous channel for the same transfer may still be winding down.
    let key = request.key();
    if !engine
        .network
        .active()
        .release(&key, engine.config.connection_timeout())
        .await
    {
        return Err(FerryError::refused(
            ErrorCode::QueryStillRunning,
            format!("transfer {key} is still running"),
        ));
    }
    let guard = engine.network.active().register(&key)?;
    Ok((rule, guard))
}

/// Row for the request: a new one, or the previous attempt put back in line
async fn load_runner(engine: &EngineContext, rule: &Rule, request: &TransferRequest) -> Result<TaskRunner> {
    let key = request.key();
    match engine.repo.select(&key).await? {
        Some(runner) if runner.is_all_done() => Err(FerryError::refused(
            ErrorCode::QueryAlreadyFinished,
            format!("transfer {key} is already done"),
        )),
        Some(runner) if matches!(runner.updated_info, UpdatedInfo::Interrupted | UpdatedInfo::InError) => {
            engine.repo.restart(&key).await
        }
        Some(runner) => Ok(runner),
        None => {
            let local = engine.config.host_id();
            let runner = TaskRunner::new(key, rule, &local, &request.filename, &request.file_info);
            engine.repo.insert(&runner).await?;
            Ok(runner)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    engine: &EngineContext,
    channel: &mut Channel,
    peer: &HostAuth,
    caps: BlockOptions,
    request: &TransferRequest,
    rule: &Rule,
    runner: TaskRunner,
    control: &ChannelControl,
) -> Result<TaskRunner> {
    let key = request.key();

    let blocksize = engine.config.clamp_blocksize(request.blocksize).min(request.blocksize.max(1));
    let options = BlockOptions {
        compression: request.compression && caps.compression,
        block_digest: request.block_digest && caps.block_digest,
    };

    let source = engine.send_path(rule, &request.filename);
    let part = engine.work_path(rule, &request.filename, key.special_id);
    let target = engine.receive_path(rule, &request.filename);

    let file_size = if runner.is_sender {
        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|_| FerryError::FileNotFound(source.clone()))?;
        Some(meta.len())
    } else {
        request.file_size
    };

    // What this side can resume from, if anything
    let usable = match runner.resume_rank() {
        Some(rank) if runner.blocksize == blocksize && !runner.is_sender => {
            data::usable_receive_rank(&part, rank, blocksize).await
        }
        Some(rank) if runner.blocksize == blocksize => rank,
        _ => 0,
    };
    let rank = request.rank.min(usable);

    engine
        .repo
        .mutate(&key, |r| {
            r.set_running();
            r.use_digest = request.use_digest;
            r.is_block_compression = options.compression;
            r.file_size = file_size;
            Ok(())
        })
        .await?;

    if !runner.global_last_step.has_reached(GlobalStep::TransferTask) {
        engine.repo.set_step(&key, GlobalStep::PreTask, ErrorCode::Running).await?;
        let path = if runner.is_sender { source.clone() } else { target.clone() };
        engine
            .tasks
            .run_step(engine, &key, GlobalStep::PreTask, &rule.pre_tasks, path)
            .await?;
        engine
            .repo
            .set_step(&key, GlobalStep::PreTask, ErrorCode::PreProcessingOk)
            .await?;
    }

    engine
        .repo
        .mutate(&key, |r| {
            if r.global_last_step.has_reached(GlobalStep::PostTask) || r.rank != rank {
                r.restart_from(rank);
            }
            r.set_step(GlobalStep::TransferTask, ErrorCode::Running)?;
            r.blocksize = blocksize;
            Ok(())
        })
        .await?;

    channel
        .send(&Packet::Request(TransferRequest {
            blocksize,
            rank,
            file_size,
            compression: options.compression,
            block_digest: options.block_digest,
            answer: true,
            ..request.clone()
        }))
        .await?;
    info!("Transfer {} with {} started at rank {}", key, peer.host_id, rank);
    engine.emit(CoreEvent::TransferStarted { key: key.clone(), rank });

    let session = DataSession::new(engine, key.clone(), peer, control, rule, blocksize, options);
    let path = if runner.is_sender {
        let blocks = session.send_file(channel, &source, rank).await?;
        session.finish_send(channel, &source, blocks, request.use_digest).await?;
        source
    } else {
        let (blocks, end) = session.receive_file(channel, &part, rank).await?;
        session
            .finish_receive(channel, &part, &target, &end, blocks, request.use_digest)
            .await?;
        engine
            .tasks
            .run_step(engine, &key, GlobalStep::TransferTask, &rule.transfer_tasks, target)
            .await?
    };
    engine
        .repo
        .set_step(&key, GlobalStep::TransferTask, ErrorCode::TransferOk)
        .await?;

    engine.repo.set_step(&key, GlobalStep::PostTask, ErrorCode::Running).await?;
    engine
        .tasks
        .run_step(engine, &key, GlobalStep::PostTask, &rule.post_tasks, path)
        .await?;
    engine
        .repo
        .set_step(&key, GlobalStep::PostTask, ErrorCode::PostProcessingOk)
        .await?;

    channel
        .send(&Packet::EndRequest(EndRequest {
            code: ErrorCode::CompleteOk,
            message: None,
            answer: false,
        }))
        .await?;
    channel.set_state(ChannelState::Close);
    engine.repo.mark_done(&key).await
}
