//! Requester side of a transfer: the host that opens the channel

use crate::context::EngineContext;
use crate::error::{FerryError, Result};
use ferry_types::{CoreEvent, ErrorCode, GlobalStep, HostAuth, Rule, TaskKey, TaskRunner};
use std::path::PathBuf;
use tracing::{debug, info};

use super::active::ChannelControl;
use super::auth;
use super::block::BlockOptions;
use super::connection::Channel;
use super::data::{self, DataSession};
use super::fsm::ChannelState;
use super::packet::{Authent, Packet, TransferRequest, PROTOCOL_VERSION};

/// Open an authenticated channel to `host`. Returns the channel and the
/// capabilities both sides share.
pub(crate) async fn connect(engine: &EngineContext, host: &HostAuth) -> Result<(Channel, BlockOptions)> {
    let local = engine.local_host()?;
    let mut channel = engine.network.open_channel(host).await?;
    match handshake(engine, &mut channel, &local, host).await {
        Ok(caps) => Ok((channel, caps)),
        Err(e) => {
            if matches!(e, FerryError::Authentication(_)) {
                engine.network.record_auth_failure(&host.socket_address());
            }
            channel.fail(&e).await;
            Err(e)
        }
    }
}

async fn handshake(engine: &EngineContext, channel: &mut Channel, local: &HostAuth, host: &HostAuth) -> Result<BlockOptions> {
    let settings = engine.config.snapshot();
    let hello = Authent {
        host_id: local.host_id.clone(),
        nonce: auth::nonce(),
        proof: String::new(),
        version: PROTOCOL_VERSION,
        use_compression: settings.use_compression,
        use_block_digest: settings.use_block_digest,
        answer: false,
    };
    channel.send(&Packet::Authent(hello.clone())).await?;
    channel.set_state(ChannelState::Authent);

    let answer = match data::receive(channel, engine.config.connection_timeout()).await? {
        Packet::Authent(answer) if answer.answer => answer,
        other => {
            return Err(FerryError::Protocol(format!(
                "expected AUTHENT answer, got {:?}",
                other.kind()
            )))
        }
    };
    if answer.host_id != host.host_id || !auth::verify(host, &hello.nonce, &answer.proof) {
        return Err(FerryError::Authentication(format!(
            "{} did not prove to be {}",
            answer.host_id, host.host_id
        )));
    }
    if answer.version != PROTOCOL_VERSION {
        return Err(FerryError::Protocol(format!(
            "{} speaks protocol {}, we speak {}",
            host.host_id, answer.version, PROTOCOL_VERSION
        )));
    }

    // Our proof goes out unanswered: a refusal comes back as an ERROR on
    // the next exchange.
    channel
        .send(&Packet::Authent(Authent {
            nonce: String::new(),
            proof: auth::proof(&local.host_id, &local.key, &answer.nonce),
            ..hello
        }))
        .await?;

    debug!("Authenticated with {} on channel {}", host.host_id, channel.id());
    Ok(BlockOptions {
        compression: settings.use_compression && answer.use_compression,
        block_digest: settings.use_block_digest && answer.use_block_digest,
    })
}

/// Run one attempt of the transfer `key` owned by this host
pub(crate) async fn run(engine: &EngineContext, key: &TaskKey, control: &ChannelControl) -> Result<TaskRunner> {
    control.check()?;
    let runner = engine.repo.get(key).await?;
    let rule = engine.catalog.rule(&runner.rule_id)?;
    let host = engine.catalog.host(runner.remote_host())?;

    let mut path = if runner.is_sender {
        engine.send_path(&rule, &runner.filename)
    } else {
        engine.receive_path(&rule, &runner.filename)
    };

    // The remote side already finished; only our post tasks were left.
    if runner.global_last_step.has_reached(GlobalStep::PostTask) {
        return finish(engine, key, &rule, path).await;
    }

    if !runner.global_last_step.has_reached(GlobalStep::TransferTask) {
        engine.repo.set_step(key, GlobalStep::PreTask, ErrorCode::Running).await?;
        let moved = engine
            .tasks
            .run_step(engine, key, GlobalStep::PreTask, &rule.pre_tasks, path.clone())
            .await?;
        engine
            .repo
            .mutate(key, |r| {
                if runner.is_sender && moved != path {
                    r.filename = moved.display().to_string();
                }
                Ok(r.set_step(GlobalStep::PreTask, ErrorCode::PreProcessingOk)?)
            })
            .await?;
        path = moved;
    }

    if runner.is_sender {
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|_| FerryError::FileNotFound(path.clone()))?
            .len();
        engine
            .repo
            .mutate(key, |r| {
                r.file_size = Some(size);
                Ok(())
            })
            .await?;
    }

    let (mut channel, caps) = connect(engine, &host).await?;
    match exchange(engine, &mut channel, key, &rule, &host, caps, control, path).await {
        Ok(path) => finish(engine, key, &rule, path).await,
        Err(e) => {
            channel.fail(&e).await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn exchange(
    engine: &EngineContext,
    channel: &mut Channel,
    key: &TaskKey,
    rule: &Rule,
    host: &HostAuth,
    caps: BlockOptions,
    control: &ChannelControl,
    path: PathBuf,
) -> Result<PathBuf> {
    let runner = engine.repo.get(key).await?;
    let part = engine.work_path(rule, &runner.filename, runner.special_id);

    let resume = runner.resume_rank().unwrap_or(0);
    let proposed = if runner.is_sender {
        resume
    } else {
        data::usable_receive_rank(&part, resume, runner.blocksize).await
    };

    channel
        .send(&Packet::Request(TransferRequest {
            special_id: runner.special_id,
            requester: runner.requester.clone(),
            requested: runner.requested.clone(),
            rule_id: rule.id.clone(),
            filename: runner.filename.clone(),
            file_info: runner.file_info.clone(),
            mode: rule.mode,
            blocksize: runner.blocksize,
            rank: proposed,
            file_size: runner.file_size,
            use_digest: runner.use_digest,
            compression: caps.compression,
            block_digest: caps.block_digest,
            answer: false,
        }))
        .await?;

    let answer = match data::receive(channel, engine.config.idle_timeout()).await? {
        Packet::Request(answer) if answer.answer => answer,
        other => {
            return Err(FerryError::Protocol(format!(
                "expected REQUEST answer, got {:?}",
                other.kind()
            )))
        }
    };
    if answer.key() != *key
        || answer.rank > proposed
        || answer.blocksize == 0
        || answer.blocksize > runner.blocksize
        || (answer.compression && !caps.compression)
        || (answer.block_digest && !caps.block_digest)
    {
        return Err(FerryError::Protocol(format!(
            "{} answered with terms it was not offered",
            host.host_id
        )));
    }

    let options = BlockOptions {
        compression: answer.compression,
        block_digest: answer.block_digest,
    };
    let rank = answer.rank;
    let runner = engine
        .repo
        .mutate(key, |r| {
            r.set_step(GlobalStep::TransferTask, ErrorCode::Running)?;
            if r.rank != rank {
                r.restart_from(rank);
            }
            r.blocksize = answer.blocksize;
            r.is_block_compression = options.compression;
            if !r.is_sender {
                r.file_size = answer.file_size;
            }
            Ok(())
        })
        .await?;
    info!("Transfer {} started with {} at rank {}", key, host.host_id, rank);
    engine.emit(CoreEvent::TransferStarted { key: key.clone(), rank });

    let session = DataSession::new(engine, key.clone(), host, control, rule, runner.blocksize, options);
    let path = if runner.is_sender {
        let blocks = session.send_file(channel, &path, rank).await?;
        session.finish_send(channel, &path, blocks, runner.use_digest).await?;
        path
    } else {
        let (blocks, end) = session.receive_file(channel, &part, rank).await?;
        session
            .finish_receive(channel, &part, &path, &end, blocks, runner.use_digest)
            .await?;
        engine
            .tasks
            .run_step(engine, key, GlobalStep::TransferTask, &rule.transfer_tasks, path)
            .await?
    };
    engine.repo.set_step(key, GlobalStep::TransferTask, ErrorCode::TransferOk).await?;

    match session.next(channel).await? {
        Packet::EndRequest(end) if end.code.is_success() => {}
        Packet::EndRequest(end) => {
            return Err(FerryError::from_remote(end.code, end.message.unwrap_or_default()));
        }
        other => {
            return Err(FerryError::Protocol(format!(
                "expected END_REQUEST, got {:?}",
                other.kind()
            )))
        }
    }
    engine.repo.set_step(key, GlobalStep::PostTask, ErrorCode::Running).await?;
    Ok(path)
}

/// Post tasks, then DONE
async fn finish(engine: &EngineContext, key: &TaskKey, rule: &Rule, path: PathBuf) -> Result<TaskRunner> {
    engine.repo.set_step(key, GlobalStep::PostTask, ErrorCode::Running).await?;
    engine
        .tasks
        .run_step(engine, key, GlobalStep::PostTask, &rule.post_tasks, path)
        .await?;
    engine
        .repo
        .set_step(key, GlobalStep::PostTask, ErrorCode::PostProcessingOk)
        .await?;
    engine.repo.mark_done(key).await
}
