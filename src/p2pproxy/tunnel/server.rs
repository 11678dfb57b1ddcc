use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::p2pproxy::{
    net,
    tunnel::{
        channel::{self, FrameReader, Inbound},
        netserver::NetServer,
        protocol::{Command, FrameHeader, ProtocolError},
        session::Session,
    },
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub handshake_timeout: Duration,
    pub dead_timeout: Duration,
    /// How often the dead-peer monitor looks at the last read time.
    pub check_interval: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: String::new(),
            handshake_timeout: Duration::from_secs(10),
            dead_timeout: Duration::from_secs(120),
            check_interval: Duration::from_secs(1),
        }
    }
}

/// Public-side terminus of the control channel. Holds at most one registered
/// P2pClient connection at a time.
pub struct P2pServer {
    opts: ServerOptions,
    control: ArcSwapOption<Session>,
    net: OnceLock<Weak<NetServer>>,
}

impl std::fmt::Debug for P2pServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pServer")
            .field("listen_addr", &self.opts.listen_addr)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl P2pServer {
    pub fn new(mut opts: ServerOptions) -> Arc<Self> {
        if opts.check_interval.is_zero() {
            opts.check_interval = Duration::from_secs(1);
        }
        Arc::new(Self {
            opts,
            control: ArcSwapOption::empty(),
            net: OnceLock::new(),
        })
    }

    pub(crate) fn attach(&self, net: &Arc<NetServer>) {
        let _ = self.net.set(Arc::downgrade(net));
    }

    fn netserver(&self) -> Option<Arc<NetServer>> {
        self.net.get().and_then(Weak::upgrade)
    }

    /// True while a control channel occupies the slot.
    pub fn is_connected(&self) -> bool {
        self.control.load().is_some()
    }

    /// Queues a payload-less command for connection `id`.
    pub fn send_cmd(&self, id: u32, cmd: Command) -> bool {
        match self.control.load_full() {
            Some(ctl) => ctl.write_command(FrameHeader::control(id, cmd)),
            None => false,
        }
    }

    /// Queues a DATA frame for connection `id` as one contiguous write.
    pub fn send_data(&self, id: u32, payload: &[u8]) -> bool {
        match self.control.load_full() {
            Some(ctl) => ctl.write_frame(id, Command::Data, payload),
            None => false,
        }
    }

    /// Drops the registered control channel, if any.
    pub fn close(&self) {
        if let Some(ctl) = self.control.load_full() {
            ctl.close();
        }
    }

    pub async fn listen_and_serve(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind p2p {}", self.opts.listen_addr))?;
        tracing::info!(listen_addr = %self.opts.listen_addr, "p2p-server: listening");
        self.serve(ln, &mut shutdown).await
    }

    pub(crate) async fn serve(
        self: Arc<Self>,
        ln: TcpListener,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = res?;
                    let srv = self.clone();
                    tokio::spawn(async move { srv.handle(conn, peer).await });
                }
            }
        }

        self.close();
        Ok(())
    }

    async fn handle(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        tracing::info!(peer = %peer, "p2p-server: connect");

        if self.is_connected() {
            tracing::warn!(peer = %peer, "p2p-server: control channel busy; rejecting");
            return;
        }

        let sess = Arc::new(Session::new(conn));
        match tokio::time::timeout(self.opts.handshake_timeout, channel::read_header(&sess)).await {
            Ok(Ok(Some(h))) if h.is_hello() => {}
            Ok(Ok(Some(h))) => {
                tracing::warn!(peer = %peer, err = %ProtocolError::BadHandshake(h), "p2p-server: verify client failed");
                sess.close();
                return;
            }
            Ok(Ok(None)) => {
                tracing::warn!(peer = %peer, "p2p-server: closed before handshake");
                sess.close();
                return;
            }
            Ok(Err(err)) => {
                tracing::warn!(peer = %peer, err = %err, "p2p-server: verify client failed");
                sess.close();
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer, "p2p-server: handshake timed out");
                sess.close();
                return;
            }
        }

        let prev = self
            .control
            .compare_and_swap(&None::<Arc<Session>>, Some(sess.clone()));
        if prev.is_some() {
            tracing::warn!(peer = %peer, "p2p-server: control channel busy; rejecting");
            sess.close();
            return;
        }
        metrics::counter!("p2pproxy_control_sessions_total").increment(1);
        tracing::info!(peer = %peer, "p2p-server: client login");

        let writer = tokio::spawn({
            let sess = sess.clone();
            async move { sess.write_loop().await }
        });
        let monitor = tokio::spawn(dead_peer_monitor(
            sess.clone(),
            self.opts.check_interval,
            self.opts.dead_timeout,
        ));

        if let Err(err) = self.read_loop(&sess).await {
            tracing::warn!(peer = %peer, err = %err, "p2p-server: control channel error");
        }

        sess.close();
        monitor.abort();
        // Public clients go first; only then may a new control channel register.
        let closed = self.netserver().map(|n| n.shutdown_all()).unwrap_or(0);
        let _ = self.control.compare_and_swap(&sess, None::<Arc<Session>>);
        let _ = writer.await;
        tracing::info!(peer = %peer, clients_closed = closed, "p2p-server: disconnect");
    }

    async fn read_loop(&self, sess: &Arc<Session>) -> Result<(), ProtocolError> {
        let mut frames = FrameReader::new(channel::DEFAULT_CHUNK);
        while let Some(ev) = frames.next(sess).await? {
            match ev {
                Inbound::Data { id, payload } => self.forward(id, payload),
                Inbound::Command(h) => match h.command {
                    Command::Logout => {
                        if let Some(n) = self.netserver() {
                            n.shutdown_client(h.id);
                        }
                    }
                    Command::Timer => {
                        sess.write_command(FrameHeader::heartbeat());
                    }
                    other => {
                        tracing::debug!(cmd = %other, id = h.id, "p2p-server: ignoring command")
                    }
                },
            }
        }
        Ok(())
    }

    fn forward(&self, id: u32, payload: Bytes) {
        metrics::counter!("p2pproxy_bytes_egress_total").increment(payload.len() as u64);
        match self.netserver() {
            Some(n) => n.send_data(id, payload),
            None => tracing::warn!(id, "p2p-server: no netserver attached; dropping data"),
        }
    }
}

/// Closes `sess` once it has gone `dead_timeout` without a successful read.
async fn dead_peer_monitor(sess: Arc<Session>, every: Duration, dead_timeout: Duration) {
    loop {
        tokio::select! {
            _ = sess.closed() => return,
            _ = tokio::time::sleep(every) => {}
        }
        if sess.is_timeout(dead_timeout) {
            tracing::warn!(
                peer = ?sess.peer(),
                timeout = %humantime::format_duration(dead_timeout),
                "p2p-server: control channel timed out"
            );
            sess.close();
            return;
        }
    }
}
