//! Physical connections of this host
//!
//! Outbound links are pooled per remote address and shared by every channel
//! going there. Inbound links come from the listener. Addresses that keep
//! failing are blacklisted for a while.

use crate::config::ConfigContext;
use crate::error::{FerryError, Result};
use ferry_types::HostAuth;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::active::ActiveChannels;
use super::blacklist::Blacklist;
use super::connection::{Channel, ChannelAcceptor, Connection, LinkLimits};
use super::tls;

/// Ban applied after repeated authentication failures, in connection timeouts
const AUTH_BAN_FACTOR: u32 = 5;

#[derive(Debug)]
struct Inner {
    config: ConfigContext,
    outbound: Mutex<HashMap<String, Connection>>,
    inbound: Mutex<Vec<Connection>>,
    blacklist: Blacklist,
    active: ActiveChannels,
    blocked: AtomicBool,
    listening: CancellationToken,
}

/// Owner of every connection of this host
#[derive(Clone, Debug)]
pub struct NetworkTransaction {
    inner: Arc<Inner>,
}

impl NetworkTransaction {
    pub fn new(config: ConfigContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                outbound: Mutex::new(HashMap::new()),
                inbound: Mutex::new(Vec::new()),
                blacklist: Blacklist::new(),
                active: ActiveChannels::new(),
                blocked: AtomicBool::new(false),
                listening: CancellationToken::new(),
            }),
        }
    }

    pub fn active(&self) -> &ActiveChannels {
        &self.inner.active
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.inner.blacklist
    }

    /// Whether new transfer requests are refused
    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::SeqCst)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.inner.blocked.store(blocked, Ordering::SeqCst);
        info!("New requests {}", if blocked { "blocked" } else { "accepted" });
    }

    pub async fn connection_count(&self) -> usize {
        let outbound = self.inner.outbound.lock().values().filter(|c| !c.is_closed()).count();
        let inbound = self.inner.inbound.lock().iter().filter(|c| !c.is_closed()).count();
        outbound + inbound
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// New channel to `host`, reusing a live connection when there is one
    ///
    /// The pool is never locked while dialing, so a slow peer only delays
    /// its own callers.
    pub async fn open_channel(&self, host: &HostAuth) -> Result<Channel> {
        let address = host.socket_address();
        if self.inner.blacklist.is_banned(&address) {
            return Err(FerryError::Blacklisted(address));
        }

        if let Some(channel) = self.pooled_channel(&address) {
            return Ok(channel);
        }

        let connection = match self.dial(host).await {
            Ok(connection) => connection,
            Err(e) => {
                let settings = self.inner.config.snapshot();
                self.inner.blacklist.record_failure(
                    &address,
                    settings.blacklist.threshold,
                    Duration::from_millis(settings.blacklist.window_ms),
                    self.inner.config.connection_timeout(),
                );
                return Err(e);
            }
        };
        debug!("Connected to {} at {}", host.host_id, address);

        let mut outbound = self.inner.outbound.lock();
        if let Some(existing) = outbound.get(&address) {
            // Someone else dialed the same peer meanwhile: keep theirs.
            if let Ok(channel) = existing.open_channel() {
                drop(outbound);
                connection.close();
                return Ok(channel);
            }
        }
        outbound.insert(address, connection.clone());
        connection.open_channel()
    }

    /// Channel on the live pooled connection to `address`, dropping a dead one
    fn pooled_channel(&self, address: &str) -> Option<Channel> {
        let mut outbound = self.inner.outbound.lock();
        let channel = outbound.get(address)?.open_channel().ok();
        if channel.is_none() {
            outbound.remove(address);
        }
        channel
    }

    fn limits(&self) -> LinkLimits {
        LinkLimits::new(self.inner.config.snapshot().max_blocksize, self.inner.config.idle_timeout())
    }

    async fn dial(&self, host: &HostAuth) -> Result<Connection> {
        let address = host.socket_address();
        let timeout = self.inner.config.connection_timeout();
        let limits = self.limits();

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(FerryError::Connection(format!("{address}: {e}"))),
            Err(_) => return Err(FerryError::Connection(format!("{address}: connect timed out"))),
        };
        let peer = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);

        if !host.is_ssl {
            return Ok(Connection::spawn(stream, peer, limits, None));
        }

        let connector = tls::connector();
        match tokio::time::timeout(timeout, connector.connect(tls::server_name(), stream)).await {
            Ok(Ok(stream)) => Ok(Connection::spawn(stream, peer, limits, None)),
            Ok(Err(e)) => Err(FerryError::Connection(format!("{address}: TLS handshake failed: {e}"))),
            Err(_) => Err(FerryError::Connection(format!("{address}: TLS handshake timed out"))),
        }
    }

    /// Count an authentication failure against `address`
    pub fn record_auth_failure(&self, address: &str) {
        let settings = self.inner.config.snapshot();
        self.inner.blacklist.record_failure(
            address,
            settings.blacklist.threshold,
            Duration::from_millis(settings.blacklist.window_ms),
            self.inner.config.connection_timeout() * AUTH_BAN_FACTOR,
        );
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Bind the configured listen address and accept connections until
    /// [`close_all`](Self::close_all). Returns the bound address.
    pub async fn listen(&self, acceptor: Arc<dyn ChannelAcceptor>) -> Result<SocketAddr> {
        let settings = self.inner.config.snapshot();
        let tls = if settings.use_tls {
            match (&settings.tls_cert, &settings.tls_key) {
                (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
                _ => {
                    return Err(FerryError::Config(
                        "use_tls requires tls_cert and tls_key".to_string(),
                    ))
                }
            }
        } else {
            None
        };

        let listener = TcpListener::bind(&settings.listen_address)
            .await
            .map_err(|e| FerryError::Connection(format!("cannot listen on {}: {e}", settings.listen_address)))?;
        let local = listener.local_addr()?;
        info!(
            "Listening on {}{}",
            local,
            if tls.is_some() { " with TLS" } else { "" }
        );

        let this = self.clone();
        let token = self.inner.listening.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => this.accept(socket, peer, tls.clone(), acceptor.clone()),
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
            debug!("Listener on {} stopped", local);
        });

        Ok(local)
    }

    fn accept(
        &self,
        socket: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsAcceptor>,
        acceptor: Arc<dyn ChannelAcceptor>,
    ) {
        let ip = peer.ip().to_string();
        if self.inner.blacklist.is_banned(&ip) {
            debug!("Refusing blacklisted address {}", ip);
            return;
        }
        let _ = socket.set_nodelay(true);

        let this = self.clone();
        tokio::spawn(async move {
            let limits = this.limits();
            let connection = match tls {
                None => Connection::spawn(socket, peer, limits, Some(acceptor)),
                Some(tls) => {
                    let timeout = this.inner.config.connection_timeout();
                    match tokio::time::timeout(timeout, tls.accept(socket)).await {
                        Ok(Ok(stream)) => Connection::spawn(stream, peer, limits, Some(acceptor)),
                        Ok(Err(e)) => {
                            warn!("TLS handshake with {} failed: {}", peer, e);
                            this.record_auth_failure(&ip);
                            return;
                        }
                        Err(_) => {
                            warn!("TLS handshake with {} timed out", peer);
                            return;
                        }
                    }
                }
            };
            debug!("Accepted connection from {}", peer);
            let mut inbound = this.inner.inbound.lock();
            inbound.retain(|c| !c.is_closed());
            inbound.push(connection);
        });
    }

    /// Stop listening and drop every connection
    pub async fn close_all(&self) {
        self.inner.listening.cancel();
        let outbound: Vec<Connection> = self.inner.outbound.lock().drain().map(|(_, c)| c).collect();
        for connection in outbound {
            connection.close();
        }
        for connection in self.inner.inbound.lock().drain(..) {
            connection.close();
        }
        info!("All connections closed");
    }

    /// Drop every outbound connection, keeping the listener
    pub async fn disconnect_outbound(&self) {
        let outbound: Vec<(String, Connection)> = self.inner.outbound.lock().drain().collect();
        for (address, connection) in outbound {
            debug!("Closing connection to {}", address);
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::Settings;

    fn network(threshold: u32) -> NetworkTransaction {
        let mut settings = Settings::default();
        settings.connection_timeout_ms = 500;
        settings.blacklist.threshold = threshold;
        NetworkTransaction::new(ConfigContext::new(settings))
    }

    #[tokio::test]
    async fn unreachable_address_ends_up_blacklisted() {
        // Grab a free port and release it so nothing listens there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let host = HostAuth::new("gone", "127.0.0.1", port, "k");
        let network = network(1);

        assert!(matches!(
            network.open_channel(&host).await,
            Err(FerryError::Connection(_))
        ));
        assert!(matches!(
            network.open_channel(&host).await,
            Err(FerryError::Connection(_))
        ));
        assert!(matches!(
            network.open_channel(&host).await,
            Err(FerryError::Blacklisted(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_tls_peer_does_not_stall_other_hosts() {
        // Neither listener ever accepts; the kernel still completes the TCP
        // handshake, so only the TLS handshake hangs.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let healthy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut slow = HostAuth::new("slow", "127.0.0.1", silent.local_addr().unwrap().port(), "k");
        slow.is_ssl = true;
        let fast = HostAuth::new("fast", "127.0.0.1", healthy.local_addr().unwrap().port(), "k");

        let mut settings = Settings::default();
        settings.connection_timeout_ms = 3_000;
        let network = NetworkTransaction::new(ConfigContext::new(settings));

        let stalled = {
            let network = network.clone();
            tokio::spawn(async move { network.open_channel(&slow).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let channel = network.open_channel(&fast).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
        assert_eq!(network.connection_count().await, 1);
        drop(channel);

        assert!(matches!(stalled.await.unwrap(), Err(FerryError::Connection(_))));
    }

    #[tokio::test]
    async fn live_connection_is_shared_between_channels() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = HostAuth::new("peer", "127.0.0.1", listener.local_addr().unwrap().port(), "k");
        let network = network(3);

        let one = network.open_channel(&host).await.unwrap();
        let two = network.open_channel(&host).await.unwrap();
        assert_ne!(one.id(), two.id());
        assert_eq!(network.connection_count().await, 1);

        network.disconnect_outbound().await;
        assert_eq!(network.connection_count().await, 0);
        let three = network.open_channel(&host).await.unwrap();
        assert_eq!(three.id(), 1);
    }

    #[tokio::test]
    async fn block_flag_toggles() {
        let network = network(3);
        assert!(!network.is_blocked());
        network.set_blocked(true);
        assert!(network.is_blocked());
    }
}
