//! One physical link multiplexing logical channels
//!
//! A reader task routes incoming frames to per-channel queues and a writer
//! task serializes outgoing frames. Packets stay ordered within a channel;
//! channels interleave freely. The reader never waits on a channel: one whose
//! queue is full is failed on its own and its siblings keep flowing.
//!
//! A link that carries no channel and stays silent for the idle timeout is
//! closed.

use crate::error::{FerryError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::framing::{Frame, FrameError, FrameReader, FrameWriter, DEFAULT_FRAME_TIMEOUT};
use super::fsm::{transition, Action, ChannelState};
use super::packet::{Flag, Packet};

const OUTBOUND_QUEUE: usize = 64;
pub(crate) const INBOUND_QUEUE: usize = 256;

/// Decoded packet, or the reason it could not be decoded
type Inbound = std::result::Result<Packet, String>;

/// Read limits of one link
#[derive(Clone, Copy, Debug)]
pub struct LinkLimits {
    pub max_blocksize: u32,
    /// Silence after which a link without channels is dropped
    pub idle_timeout: Duration,
}

impl LinkLimits {
    pub fn new(max_blocksize: u32, idle_timeout: Duration) -> Self {
        Self {
            max_blocksize,
            idle_timeout,
        }
    }
}

/// Receives channels opened by the remote side
pub trait ChannelAcceptor: Send + Sync + 'static {
    fn accept(&self, channel: Channel);
}

/// Where the reader sends frames of one channel id
#[derive(Debug)]
enum Route {
    Open {
        tx: mpsc::Sender<Inbound>,
        overflowed: Arc<AtomicBool>,
    },
    /// Queue overflowed; later frames are dropped until the channel is gone
    Failed,
}

#[derive(Debug)]
struct ConnectionInner {
    peer: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    channels: Mutex<HashMap<u32, Route>>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

impl ConnectionInner {
    fn register(self: &Arc<Self>, id: u32) -> Channel {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let overflowed = Arc::new(AtomicBool::new(false));
        self.channels.lock().insert(
            id,
            Route::Open {
                tx,
                overflowed: overflowed.clone(),
            },
        );
        Channel {
            id,
            state: ChannelState::Init,
            inbound: rx,
            overflowed,
            conn: self.clone(),
        }
    }

    async fn send_frame(&self, channel: u32, packet: &Packet) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(FerryError::Disconnected);
        }
        let frame = Frame {
            channel,
            kind: packet.kind(),
            payload: packet.encode()?,
        };
        self.outbound.send(frame).await.map_err(|_| FerryError::Disconnected)
    }

    /// Route a decoded packet to its channel without waiting. `Err` gives
    /// the packet back when no channel has this id.
    fn route(&self, channel: u32, decoded: Inbound) -> std::result::Result<(), Inbound> {
        let mut channels = self.channels.lock();
        let (tx, overflowed) = match channels.get(&channel) {
            None => return Err(decoded),
            Some(Route::Failed) => return Ok(()),
            Some(Route::Open { tx, overflowed }) => (tx.clone(), overflowed.clone()),
        };
        match tx.try_send(decoded) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                overflowed.store(true, Ordering::SeqCst);
                channels.insert(channel, Route::Failed);
                drop(channels);
                warn!("Channel {} from {} fell behind, failing it", channel, self.peer);
                let error = FerryError::Protocol(format!("channel {channel} backlog overflowed"));
                let packet = Packet::error(error.code(), error.to_string());
                // Best effort: the reader must not wait on the writer either.
                let _ = self.outbound.try_send(Frame {
                    channel,
                    kind: packet.kind(),
                    payload: packet.encode().unwrap_or_default(),
                });
            }
            Err(TrySendError::Closed(_)) => {
                channels.remove(&channel);
            }
        }
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame, acceptor: Option<&Arc<dyn ChannelAcceptor>>) {
        let decoded = Packet::decode(frame.kind, &frame.payload).map_err(|e| e.to_string());
        let decoded = match self.route(frame.channel, decoded) {
            Ok(()) => return,
            Err(decoded) => decoded,
        };

        match (decoded, acceptor) {
            (Ok(packet @ Packet::Authent(_)), Some(acceptor)) => {
                let channel = self.register(frame.channel);
                let _ = self.route(frame.channel, Ok(packet));
                acceptor.accept(channel);
            }
            (Ok(Packet::Error(_)), _) => {}
            (Ok(Packet::KeepAlive(flag)), _) if !flag.value => {
                let _ = self
                    .send_frame(frame.channel, &Packet::KeepAlive(Flag { value: true }))
                    .await;
            }
            (result, _) => {
                let reason = match result {
                    Ok(packet) => format!("{:?} on unknown channel {}", packet.kind(), frame.channel),
                    Err(e) => e,
                };
                debug!("Rejecting frame from {}: {}", self.peer, reason);
                let _ = self
                    .send_frame(
                        frame.channel,
                        &Packet::error(ferry_types::ErrorCode::IncorrectCommand, reason),
                    )
                    .await;
            }
        }
    }
}

/// Handle on a physical connection. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Start the reader and writer tasks over `stream`.
    ///
    /// With an `acceptor`, AUTHENT frames on unknown channel ids open new
    /// passive channels.
    pub fn spawn<S>(
        stream: S,
        peer: SocketAddr,
        limits: LinkLimits,
        acceptor: Option<Arc<dyn ChannelAcceptor>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let inner = Arc::new(ConnectionInner {
            peer,
            outbound: tx,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            closed: CancellationToken::new(),
        });

        tokio::spawn(writer_loop(write_half, rx, inner.closed.clone()));
        tokio::spawn(reader_loop(read_half, inner.clone(), acceptor, limits));

        Self { inner }
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Open a new logical channel from this side
    pub fn open_channel(&self) -> Result<Channel> {
        if self.is_closed() {
            return Err(FerryError::Disconnected);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = self.inner.register(id);
        // The reader may have dropped the link as idle in between.
        if self.is_closed() {
            return Err(FerryError::Disconnected);
        }
        Ok(channel)
    }

    /// Tear the link down; every channel on it sees a disconnection
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.channels.lock().clear();
    }
}

async fn writer_loop<W>(write_half: W, mut rx: mpsc::Receiver<Frame>, closed: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(write_half);
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_frame(&frame).await {
                        debug!("Write failed: {}", e);
                        closed.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.get_mut().shutdown().await;
}

async fn reader_loop<R>(
    read_half: R,
    inner: Arc<ConnectionInner>,
    acceptor: Option<Arc<dyn ChannelAcceptor>>,
    limits: LinkLimits,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(BufReader::new(read_half), limits.max_blocksize);
    loop {
        let result = tokio::select! {
            _ = inner.closed.cancelled() => break,
            result = reader.read_frame(limits.idle_timeout, DEFAULT_FRAME_TIMEOUT) => result,
        };
        match result {
            Ok(Some(frame)) => inner.dispatch(frame, acceptor.as_ref()).await,
            Ok(None) => {
                debug!("Connection to {} closed by peer", inner.peer);
                break;
            }
            Err(FrameError::IdleTimeout) => {
                // Decided under the channel lock so a concurrent open sees it.
                let channels = inner.channels.lock();
                if channels.is_empty() {
                    inner.closed.cancel();
                    drop(channels);
                    debug!("Closing idle connection to {}", inner.peer);
                    break;
                }
            }
            Err(e) => {
                warn!("Dropping connection to {}: {}", inner.peer, e);
                break;
            }
        }
    }
    inner.closed.cancel();
    inner.channels.lock().clear();
}

/// One TaskRunner's session on a shared connection
#[derive(Debug)]
pub struct Channel {
    id: u32,
    state: ChannelState,
    inbound: mpsc::Receiver<Inbound>,
    overflowed: Arc<AtomicBool>,
    conn: Arc<ConnectionInner>,
}

impl Channel {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.conn.peer
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Record a state reached by sending rather than receiving
    pub fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        self.conn.send_frame(self.id, packet).await
    }

    fn closed_error(&self) -> FerryError {
        if self.overflowed.load(Ordering::SeqCst) {
            FerryError::Protocol(format!("channel {} backlog overflowed", self.id))
        } else {
            FerryError::Disconnected
        }
    }

    /// Next packet, waiting at most `wait`. Silence is reported as `Timeout`.
    pub async fn recv(&mut self, wait: Duration) -> Result<Packet> {
        match tokio::time::timeout(wait, self.inbound.recv()).await {
            Err(_) => Err(FerryError::Timeout),
            Ok(None) => Err(self.closed_error()),
            Ok(Some(Err(reason))) => Err(FerryError::Protocol(reason)),
            Ok(Some(Ok(packet))) => Ok(packet),
        }
    }

    /// Packet already queued, if any
    pub fn try_recv(&mut self) -> Option<Result<Packet>> {
        match self.inbound.try_recv() {
            Ok(Ok(packet)) => Some(Ok(packet)),
            Ok(Err(reason)) => Some(Err(FerryError::Protocol(reason))),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.closed_error())),
        }
    }

    /// Check `packet` against the state machine and advance
    pub fn advance(&mut self, packet: &Packet) -> Result<Action> {
        match transition(self.state, packet.kind()) {
            Some((action, next)) => {
                self.state = next;
                Ok(action)
            }
            None => Err(FerryError::Protocol(format!(
                "{:?} packet not valid in state {:?}",
                packet.kind(),
                self.state
            ))),
        }
    }

    /// Report `error` to the peer and move to ERROR
    pub async fn fail(&mut self, error: &FerryError) {
        if !self.state.is_finished() {
            let _ = self.send(&Packet::error(error.code(), error.to_string())).await;
        }
        self.state = ChannelState::Error;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.conn.channels.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::TestPacket;
    use parking_lot::Mutex as SyncMutex;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn limits() -> LinkLimits {
        LinkLimits::new(1024, Duration::from_secs(30))
    }

    /// Echoes TEST packets back on every accepted channel
    struct Echo {
        accepted: SyncMutex<Vec<u32>>,
    }

    impl ChannelAcceptor for Echo {
        fn accept(&self, mut channel: Channel) {
            self.accepted.lock().push(channel.id());
            tokio::spawn(async move {
                while let Ok(packet) = channel.recv(Duration::from_secs(5)).await {
                    if let Packet::Test(mut test) = packet {
                        test.answer = true;
                        if channel.send(&Packet::Test(test)).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    }

    fn authent() -> Packet {
        Packet::Authent(crate::protocol::packet::Authent {
            host_id: "a".into(),
            nonce: "n".into(),
            proof: String::new(),
            version: 1,
            use_compression: false,
            use_block_digest: false,
            answer: false,
        })
    }

    fn test_packet(message: &str) -> Packet {
        Packet::Test(TestPacket {
            message: message.into(),
            answer: false,
        })
    }

    #[tokio::test]
    async fn channels_are_routed_independently() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let echo = Arc::new(Echo {
            accepted: SyncMutex::new(Vec::new()),
        });
        let _server = Connection::spawn(b, addr(), limits(), Some(echo.clone() as Arc<dyn ChannelAcceptor>));
        let client = Connection::spawn(a, addr(), limits(), None);

        let mut one = client.open_channel().unwrap();
        let mut two = client.open_channel().unwrap();
        one.send(&authent()).await.unwrap();
        two.send(&authent()).await.unwrap();
        two.send(&test_packet("two")).await.unwrap();
        one.send(&test_packet("one")).await.unwrap();

        let wait = Duration::from_secs(5);
        match one.recv(wait).await.unwrap() {
            Packet::Test(t) => assert_eq!(t.message, "one"),
            other => panic!("unexpected {other:?}"),
        }
        match two.recv(wait).await.unwrap() {
            Packet::Test(t) => assert_eq!(t.message, "two"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(echo.accepted.lock().len(), 2);
    }

    /// Keeps accepted channels without ever reading them
    #[derive(Default)]
    struct Hold {
        channels: SyncMutex<Vec<Channel>>,
    }

    impl ChannelAcceptor for Hold {
        fn accept(&self, channel: Channel) {
            self.channels.lock().push(channel);
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    #[tokio::test]
    async fn backlogged_channel_does_not_block_new_ones() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let hold = Arc::new(Hold::default());
        let _server = Connection::spawn(b, addr(), limits(), Some(hold.clone() as Arc<dyn ChannelAcceptor>));
        let client = Connection::spawn(a, addr(), limits(), None);

        let mut flooded = client.open_channel().unwrap();
        flooded.send(&authent()).await.unwrap();
        for i in 0..300 {
            flooded.send(&test_packet(&format!("block {i}"))).await.unwrap();
        }
        let mut fresh = client.open_channel().unwrap();
        fresh.send(&authent()).await.unwrap();

        assert!(wait_for(|| hold.channels.lock().len() == 2).await);
        match flooded.recv(Duration::from_secs(2)).await.unwrap() {
            Packet::Error(e) => assert!(e.message.contains("overflowed"), "{}", e.message),
            other => panic!("unexpected {other:?}"),
        }

        // The held side of the flooded channel reports why it went quiet.
        let mut held = hold.channels.lock().remove(0);
        while let Some(next) = held.try_recv() {
            if let Err(e) = next {
                assert!(matches!(e, FerryError::Protocol(_)));
                break;
            }
        }
    }

    #[tokio::test]
    async fn idle_link_without_channels_closes() {
        let (a, b) = tokio::io::duplex(1024);
        let server = Connection::spawn(b, addr(), LinkLimits::new(1024, Duration::from_millis(50)), None);
        let client = Connection::spawn(a, addr(), limits(), None);

        assert!(wait_for(|| server.is_closed()).await);
        assert!(wait_for(|| client.is_closed()).await);
        assert!(matches!(server.open_channel(), Err(FerryError::Disconnected)));
    }

    #[tokio::test]
    async fn idle_link_with_a_channel_stays_open() {
        let (a, _b) = tokio::io::duplex(1024);
        let client = Connection::spawn(a, addr(), LinkLimits::new(1024, Duration::from_millis(20)), None);
        let channel = client.open_channel().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!client.is_closed());

        drop(channel);
        assert!(wait_for(|| client.is_closed()).await);
    }

    #[tokio::test]
    async fn unknown_channel_gets_an_error() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let _server = Connection::spawn(b, addr(), limits(), None);
        let client = Connection::spawn(a, addr(), limits(), None);

        let mut channel = client.open_channel().unwrap();
        channel.send(&test_packet("hello")).await.unwrap();
        match channel.recv(Duration::from_secs(5)).await.unwrap() {
            Packet::Error(e) => assert_eq!(e.code, ferry_types::ErrorCode::IncorrectCommand),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn closing_disconnects_channels() {
        let (a, b) = tokio::io::duplex(1024);
        let _server = Connection::spawn(b, addr(), limits(), None);
        let client = Connection::spawn(a, addr(), limits(), None);
        let mut channel = client.open_channel().unwrap();

        client.close();
        assert!(matches!(
            channel.recv(Duration::from_secs(1)).await,
            Err(FerryError::Disconnected)
        ));
        assert!(client.open_channel().is_err());
    }

    #[test]
    fn out_of_order_packet_is_a_protocol_error() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (a, _b) = tokio::io::duplex(1024);
            let client = Connection::spawn(a, addr(), limits(), None);
            let mut channel = client.open_channel().unwrap();
            let data = Packet::Data(crate::protocol::packet::DataBlock {
                rank: 0,
                compressed: false,
                digest: None,
                payload: vec![],
            });
            assert!(matches!(channel.advance(&data), Err(FerryError::Protocol(_))));
            assert_eq!(channel.state(), ChannelState::Init);
        });
    }
}
