//! The DATA phase shared by both ends of a transfer
//!
//! One side pushes blocks, the other writes them to a partial file. The
//! receiver persists its rank after every block and acknowledges every
//! [`ACK_EVERY`] blocks; the sender persists only acknowledged ranks and
//! keeps at most [`SEND_WINDOW`] blocks unacknowledged. Abort requests are
//! only honoured between blocks.

use crate::bandwidth::SessionShaper;
use crate::context::EngineContext;
use crate::error::{FerryError, Result};
use ferry_types::{CoreEvent, ErrorCode, HostAuth, Rule, TaskKey};
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::active::ChannelControl;
use super::block::{self, BlockOptions};
use super::connection::Channel;
use super::control;
use super::fsm::{Action, ChannelState};
use super::packet::{EndTransfer, Flag, Packet, RankAck};

/// Blocks between two acknowledgements from the receiver
pub(crate) const ACK_EVERY: u64 = 8;
/// Unacknowledged blocks the sender may have in flight. Stays well below
/// the per-channel inbound queue so a receiver never overflows it.
pub(crate) const SEND_WINDOW: u64 = 4 * ACK_EVERY;

/// Next packet on `channel` that passed the state machine. ERROR packets
/// become the matching local error.
pub(crate) async fn receive(channel: &mut Channel, wait: Duration) -> Result<Packet> {
    let packet = channel.recv(wait).await?;
    match (channel.advance(&packet)?, packet) {
        (Action::RemoteError, Packet::Error(e)) => Err(FerryError::from_remote(e.code, e.message)),
        (_, packet) => Ok(packet),
    }
}

/// Block loop state for one transfer
pub(crate) struct DataSession<'a> {
    engine: &'a EngineContext,
    key: TaskKey,
    peer: &'a HostAuth,
    control: &'a ChannelControl,
    shaper: SessionShaper,
    blocksize: u32,
    options: BlockOptions,
}

impl<'a> DataSession<'a> {
    pub fn new(
        engine: &'a EngineContext,
        key: TaskKey,
        peer: &'a HostAuth,
        control: &'a ChannelControl,
        rule: &Rule,
        blocksize: u32,
        options: BlockOptions,
    ) -> Self {
        Self {
            shaper: engine.limiter.session(rule.bandwidth),
            engine,
            key,
            peer,
            control,
            blocksize,
            options,
        }
    }

    fn aborted(&self) -> FerryError {
        self.control.check().err().unwrap_or(FerryError::Stopped)
    }

    /// Next transfer packet. Control packets met on the way are served.
    pub async fn next(&self, channel: &mut Channel) -> Result<Packet> {
        let wait = self.engine.config.idle_timeout();
        loop {
            let received = tokio::select! {
                _ = self.control.cancelled() => return Err(self.aborted()),
                received = channel.recv(wait) => received,
            };
            let packet = match received {
                Err(FerryError::Timeout) => return Err(FerryError::Disconnected),
                other => other?,
            };
            if let Some(packet) = self.dispatch(channel, packet).await? {
                return Ok(packet);
            }
        }
    }

    /// Serve whatever is already queued, without waiting
    async fn poll(&self, channel: &mut Channel, acked: &mut u64, sent: u64) -> Result<()> {
        self.control.check()?;
        while let Some(received) = channel.try_recv() {
            if let Some(packet) = self.dispatch(channel, received?).await? {
                take_ack(packet, acked, sent)?;
            }
        }
        Ok(())
    }

    /// `None` when `packet` was a control handled here
    async fn dispatch(&self, channel: &mut Channel, packet: Packet) -> Result<Option<Packet>> {
        let before = channel.state();
        match (channel.advance(&packet)?, packet) {
            (Action::RemoteError, Packet::Error(e)) => Err(FerryError::from_remote(e.code, e.message)),
            (Action::Control, packet) => self.control_packet(channel, packet, before).await,
            (_, packet) => Ok(Some(packet)),
        }
    }

    async fn control_packet(&self, channel: &mut Channel, packet: Packet, before: ChannelState) -> Result<Option<Packet>> {
        match packet {
            Packet::Stop(target) if target.key == self.key => Err(FerryError::Stopped),
            Packet::Cancel(target) if target.key == self.key => Err(FerryError::Cancelled),
            Packet::Shutdown(_) => Err(FerryError::from_remote(ErrorCode::Shutdown, "peer is shutting down")),
            Packet::KeepAlive(Flag { value }) => {
                if !value {
                    channel.send(&Packet::KeepAlive(Flag { value: true })).await?;
                }
                Ok(None)
            }
            packet => {
                // A control aimed at another transfer leaves this one running.
                control::answer(self.engine, channel, self.peer, packet).await?;
                channel.set_state(before);
                Ok(None)
            }
        }
    }

    async fn shape(&self, write: bool, bytes: u64) -> Result<()> {
        tokio::select! {
            _ = self.control.cancelled() => Err(self.aborted()),
            _ = async {
                if write {
                    self.shaper.acquire_write(bytes).await
                } else {
                    self.shaper.acquire_read(bytes).await
                }
            } => Ok(()),
        }
    }

    async fn progress(&self, rank: u64, bytes: u64) -> Result<()> {
        self.engine.repo.update_rank(&self.key, rank).await?;
        self.engine.emit(CoreEvent::TransferProgress {
            key: self.key.clone(),
            rank,
            bytes,
        });
        Ok(())
    }

    /// Push `path` from block `start_rank` on. Returns the number of blocks
    /// the file is made of.
    pub async fn send_file(&self, channel: &mut Channel, path: &Path, start_rank: u64) -> Result<u64> {
        let mut file = File::open(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FerryError::FileNotFound(path.to_path_buf()),
            _ => FerryError::Io(e),
        })?;
        let size = file.metadata().await?.len();
        file.seek(SeekFrom::Start(start_rank * self.blocksize as u64)).await?;
        debug!("Sending {} from block {}", path.display(), start_rank);

        let mut buffer = vec![0u8; self.blocksize as usize];
        let mut rank = start_rank;
        let mut acked = start_rank;
        let mut persisted = start_rank;
        loop {
            self.poll(channel, &mut acked, rank).await?;
            while rank - acked >= SEND_WINDOW {
                let packet = self.next(channel).await?;
                take_ack(packet, &mut acked, rank)?;
            }
            if acked > persisted {
                self.progress(acked, self.bytes_at(acked, size)).await?;
                persisted = acked;
            }

            let read = read_block(&mut file, &mut buffer).await?;
            if read == 0 {
                break;
            }
            self.shape(true, read as u64).await?;
            let data = block::pack(rank, &buffer[..read], self.options)?;
            channel.send(&Packet::Data(data)).await?;
            rank += 1;
            if read < buffer.len() {
                break;
            }
        }
        Ok(rank)
    }

    fn bytes_at(&self, rank: u64, size: u64) -> u64 {
        (rank * self.blocksize as u64).min(size)
    }

    /// Write incoming blocks to `part` from `start_rank` on, until the
    /// sender's END_TRANSFER. Returns the final rank and that packet.
    pub async fn receive_file(&self, channel: &mut Channel, part: &Path, start_rank: u64) -> Result<(u64, EndTransfer)> {
        if let Some(parent) = part.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(part)
            .await?;
        let offset = start_rank * self.blocksize as u64;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        debug!("Receiving into {} from block {}", part.display(), start_rank);

        let mut rank = start_rank;
        let mut written = offset;
        loop {
            match self.next(channel).await? {
                Packet::Data(data) => {
                    if data.rank != rank {
                        return Err(FerryError::Protocol(format!(
                            "expected block {rank}, got block {}",
                            data.rank
                        )));
                    }
                    let bytes = block::unpack(data, self.blocksize, self.options)?;
                    self.shape(false, bytes.len() as u64).await?;
                    file.write_all(&bytes).await?;
                    file.flush().await?;
                    rank += 1;
                    written += bytes.len() as u64;
                    self.progress(rank, written).await?;
                    if rank % ACK_EVERY == 0 {
                        channel.send(&Packet::RankAck(RankAck { rank })).await?;
                    }
                }
                Packet::EndTransfer(end) if !end.answer => {
                    file.sync_all().await?;
                    return Ok((rank, end));
                }
                other => {
                    return Err(FerryError::Protocol(format!(
                        "unexpected {:?} while receiving blocks",
                        other.kind()
                    )))
                }
            }
        }
    }

    /// Check the received file against the sender's END_TRANSFER, move it to
    /// `target` and confirm.
    pub async fn finish_receive(
        &self,
        channel: &mut Channel,
        part: &Path,
        target: &Path,
        end: &EndTransfer,
        rank: u64,
        use_digest: bool,
    ) -> Result<()> {
        if end.rank != rank {
            return Err(FerryError::Protocol(format!(
                "sender reports {} blocks, {} received",
                end.rank, rank
            )));
        }
        if use_digest {
            let expected = end
                .digest
                .clone()
                .ok_or_else(|| FerryError::Protocol("END_TRANSFER without digest".into()))?;
            let actual = block::file_digest(part).await?;
            if actual != expected {
                // Not resumable: drop what was written.
                let _ = fs::remove_file(part).await;
                return Err(FerryError::Integrity { expected, actual });
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        crate::tasks::move_file(part, target).await?;
        debug!("Stored {} as {}", self.key, target.display());

        channel
            .send(&Packet::EndTransfer(EndTransfer {
                digest: None,
                rank,
                answer: true,
            }))
            .await
    }

    /// Close the sending side: announce the end and wait for the receiver.
    /// Its answer acknowledges every block.
    pub async fn finish_send(&self, channel: &mut Channel, path: &Path, rank: u64, use_digest: bool) -> Result<()> {
        let digest = if use_digest {
            Some(block::file_digest(path).await?)
        } else {
            None
        };
        channel
            .send(&Packet::EndTransfer(EndTransfer {
                digest,
                rank,
                answer: false,
            }))
            .await?;

        loop {
            match self.next(channel).await? {
                // Late acknowledgements of the last window
                Packet::RankAck(_) => continue,
                Packet::EndTransfer(end) if end.answer => {
                    let size = fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
                    return self.progress(rank, self.bytes_at(rank, size)).await;
                }
                other => {
                    return Err(FerryError::Protocol(format!(
                        "expected END_TRANSFER answer, got {:?}",
                        other.kind()
                    )))
                }
            }
        }
    }
}

/// Record a receiver acknowledgement, never past the `sent` blocks.
/// Anything else is out of place while blocks are being sent.
fn take_ack(packet: Packet, acked: &mut u64, sent: u64) -> Result<()> {
    match packet {
        Packet::RankAck(ack) => {
            *acked = (*acked).max(ack.rank.min(sent));
            Ok(())
        }
        other => Err(FerryError::Protocol(format!(
            "unexpected {:?} while sending blocks",
            other.kind()
        ))),
    }
}

/// Fill `buffer` unless the file ends first
async fn read_block(file: &mut File, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Rank a receiver can offer: never past the bytes really on disk
pub(crate) async fn usable_receive_rank(part: &Path, rank: u64, blocksize: u32) -> u64 {
    let on_disk = fs::metadata(part).await.map(|m| m.len()).unwrap_or(0);
    rank.min(on_disk / blocksize.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partial_blocks_on_disk_are_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("f.part");
        assert_eq!(usable_receive_rank(&part, 9, 100).await, 0);

        fs::write(&part, vec![0u8; 250]).await.unwrap();
        assert_eq!(usable_receive_rank(&part, 9, 100).await, 2);
        assert_eq!(usable_receive_rank(&part, 1, 100).await, 1);
    }

    #[test]
    fn acks_only_move_forward_within_what_was_sent() {
        let mut acked = 8;
        take_ack(Packet::RankAck(RankAck { rank: 16 }), &mut acked, 20).unwrap();
        assert_eq!(acked, 16);
        take_ack(Packet::RankAck(RankAck { rank: 8 }), &mut acked, 20).unwrap();
        assert_eq!(acked, 16);
        take_ack(Packet::RankAck(RankAck { rank: 99 }), &mut acked, 20).unwrap();
        assert_eq!(acked, 20);

        let end = Packet::EndTransfer(EndTransfer {
            digest: None,
            rank: 20,
            answer: true,
        });
        assert!(matches!(take_ack(end, &mut acked, 20), Err(FerryError::Protocol(_))));
    }

    #[test]
    fn window_fits_the_inbound_queue() {
        assert!(SEND_WINDOW > ACK_EVERY);
        assert!((SEND_WINDOW as usize) < super::super::connection::INBOUND_QUEUE / 2);
    }

    #[tokio::test]
    async fn short_reads_are_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, vec![7u8; 300]).await.unwrap();

        let mut file = File::open(&path).await.unwrap();
        let mut buffer = vec![0u8; 128];
        assert_eq!(read_block(&mut file, &mut buffer).await.unwrap(), 128);
        assert_eq!(read_block(&mut file, &mut buffer).await.unwrap(), 128);
        assert_eq!(read_block(&mut file, &mut buffer).await.unwrap(), 44);
        assert_eq!(read_block(&mut file, &mut buffer).await.unwrap(), 0);
    }
}
