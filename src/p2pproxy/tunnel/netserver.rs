use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::p2pproxy::{
    net,
    tunnel::{
        protocol::Command,
        server::P2pServer,
        session::Session,
        table::{ConnInfo, ConnTable},
    },
};

#[derive(Debug, Clone)]
pub struct NetServerOptions {
    pub listen_addr: String,
    pub read_buffer: usize,
    /// Pause between LOGIN and the first forwarded byte, giving the remote
    /// side time to open its backend connection.
    pub login_grace: Duration,
}

impl Default for NetServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: String::new(),
            read_buffer: 4096,
            login_grace: Duration::from_secs(1),
        }
    }
}

/// Public-facing listener. Every accepted connection gets a fresh id and is
/// relayed over the P2pServer's control channel.
pub struct NetServer {
    opts: NetServerOptions,
    p2p: Arc<P2pServer>,
    clients: ConnTable,
    next_id: AtomicU32,
}

impl std::fmt::Debug for NetServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetServer")
            .field("listen_addr", &self.opts.listen_addr)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl NetServer {
    pub fn new(mut opts: NetServerOptions, p2p: Arc<P2pServer>) -> Arc<Self> {
        if opts.read_buffer == 0 {
            opts.read_buffer = 4096;
        }
        let ns = Arc::new(Self {
            opts,
            p2p,
            clients: ConnTable::new(),
            next_id: AtomicU32::new(1),
        });
        ns.p2p.attach(&ns);
        ns
    }

    /// Next connection id. Ids only grow; 0 is reserved for the channel.
    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ConnInfo> {
        self.clients.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Queues bytes for public client `id`; dropped with a warning if it is gone.
    pub fn send_data(&self, id: u32, payload: Bytes) {
        if !self.clients.forward(id, payload) {
            tracing::warn!(id, "netserver: data for unknown client dropped");
        }
    }

    /// Force-closes public client `id` after a remote LOGOUT.
    pub fn shutdown_client(&self, id: u32) {
        if self.clients.shutdown(id) {
            tracing::info!(id, "netserver: client closed by remote logout");
        }
    }

    pub fn shutdown_all(&self) -> usize {
        self.clients.close_all()
    }

    pub async fn listen_and_serve(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind proxy {}", self.opts.listen_addr))?;
        tracing::info!(listen_addr = %self.opts.listen_addr, "netserver: listening");
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
                    if !self.p2p.is_connected() {
                        tracing::debug!(peer = %peer, "netserver: no control channel; refusing");
                        continue;
                    }
                    let ns = self.clone();
                    tokio::spawn(async move { ns.handle(conn, peer).await });
                }
            }
        }

        self.shutdown_all();
        Ok(())
    }

    async fn handle(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        let id = self.next_id();
        let sess = Arc::new(Session::new(conn));
        self.clients.insert(id, sess.clone());
        metrics::counter!("p2pproxy_connections_total").increment(1);
        tracing::info!(id, peer = %peer, "netserver: connect");

        let writer = tokio::spawn({
            let sess = sess.clone();
            async move { sess.write_loop().await }
        });

        if self.p2p.send_cmd(id, Command::Login) {
            self.pump(id, &sess).await;
        }

        if self.clients.remove_if_same(id, &sess) {
            self.p2p.send_cmd(id, Command::Logout);
        }
        sess.close();
        let _ = writer.await;
        tracing::info!(id, peer = %peer, "netserver: disconnect");
    }

    /// Public client -> control channel.
    async fn pump(&self, id: u32, sess: &Session) {
        if !self.opts.login_grace.is_zero() {
            tokio::select! {
                _ = sess.closed() => return,
                _ = tokio::time::sleep(self.opts.login_grace) => {}
            }
        }

        loop {
            let chunk = match sess.read(self.opts.read_buffer).await {
                Ok(c) => c,
                Err(err) => {
                    tracing::debug!(id, err = %err, "netserver: read failed");
                    return;
                }
            };
            if chunk.is_empty() {
                return;
            }
            metrics::counter!("p2pproxy_bytes_ingress_total").increment(chunk.len() as u64);
            if !self.p2p.send_data(id, &chunk) {
                tracing::debug!(id, "netserver: control channel gone");
                return;
            }
        }
    }
}
