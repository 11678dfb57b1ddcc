use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpStream, sync::watch};

use crate::p2pproxy::tunnel::{
    channel::{self, FrameReader, Inbound},
    protocol::{Command, FrameHeader, ProtocolError},
    session::{CLOSE_LINGER, Session},
    table::ConnTable,
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Control-channel address of the P2pServer.
    pub control_addr: String,
    /// Backend every LOGIN connects to.
    pub backend_addr: String,
    pub dial_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub dead_timeout: Duration,
    pub retry_backoff: Duration,
    pub read_buffer: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            control_addr: String::new(),
            backend_addr: String::new(),
            dial_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            dead_timeout: Duration::from_secs(120),
            retry_backoff: Duration::from_secs(8),
            read_buffer: 4096,
        }
    }
}

/// The NAT-side half of the tunnel: keeps one outbound control channel to the
/// P2pServer and opens a backend connection for every LOGIN it receives.
pub struct P2pClient {
    opts: ClientOptions,
    backends: Arc<ConnTable>,
}

impl P2pClient {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.control_addr.trim().is_empty() {
            anyhow::bail!("p2p-client: control address is required");
        }
        if opts.backend_addr.trim().is_empty() {
            anyhow::bail!("p2p-client: backend address is required");
        }
        if opts.read_buffer == 0 {
            opts.read_buffer = 4096;
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(10);
        }
        if opts.heartbeat_interval.is_zero() {
            opts.heartbeat_interval = Duration::from_secs(30);
        }

        Ok(Self {
            opts,
            backends: Arc::new(ConnTable::new()),
        })
    }

    pub fn backends(&self) -> Arc<ConnTable> {
        self.backends.clone()
    }

    /// Keeps the control channel up until shutdown, reconnecting after a fixed
    /// backoff on every disconnect.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    metrics::counter!("p2pproxy_reconnects_total").increment(1);
                    let err = format!("{err:#}");
                    tracing::warn!(
                        server = %self.opts.control_addr,
                        err = %err,
                        backoff = %humantime::format_duration(self.opts.retry_backoff),
                        "p2p-client: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(self.opts.retry_backoff) => {}
            }
        }
    }

    /// One control-channel lifetime. `Ok` means shutdown was requested; any
    /// disconnect is an error so the caller retries.
    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.opts.control_addr.as_str();
        let stream = tokio::time::timeout(self.opts.dial_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial {addr}: timed out"))?
            .with_context(|| format!("dial {addr}"))?;

        let control = Arc::new(Session::new(stream));
        tracing::info!(server = %addr, backend = %self.opts.backend_addr, "p2p-client: connected");

        let writer = tokio::spawn({
            let control = control.clone();
            async move { control.write_loop().await }
        });
        control.write_command(FrameHeader::hello());

        let heartbeat = tokio::spawn(heartbeat_loop(
            control.clone(),
            self.opts.heartbeat_interval,
            self.opts.dead_timeout,
        ));

        let res = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => Ok(()),
            res = self.read_loop(&control) => match res {
                Ok(()) => Err(anyhow::anyhow!("control channel closed")),
                Err(err) => Err(anyhow::Error::new(err).context("control channel")),
            },
        };

        control.close();
        let closed = self.backends.close_all();
        heartbeat.abort();
        let _ = tokio::time::timeout(CLOSE_LINGER * 2, writer).await;

        tracing::info!(server = %addr, backends_closed = closed, "p2p-client: control channel down");
        res
    }

    async fn read_loop(&self, control: &Arc<Session>) -> Result<(), ProtocolError> {
        let mut frames = FrameReader::new(self.opts.read_buffer.max(channel::DEFAULT_CHUNK));
        while let Some(ev) = frames.next(control).await? {
            match ev {
                Inbound::Data { id, payload } => {
                    metrics::counter!("p2pproxy_bytes_egress_total").increment(payload.len() as u64);
                    if !self.backends.forward(id, payload) {
                        tracing::warn!(id, "p2p-client: data for unknown connection dropped");
                    }
                }
                Inbound::Command(h) => match h.command {
                    Command::Login => self.append_client(h.id, control.clone()),
                    Command::Logout => self.remove_client(h.id),
                    Command::Timer => tracing::trace!("p2p-client: heartbeat ack"),
                    other => tracing::debug!(cmd = %other, id = h.id, "p2p-client: ignoring command"),
                },
            }
        }
        Ok(())
    }

    /// Opens the backend connection for `id` in the background.
    fn append_client(&self, id: u32, control: Arc<Session>) {
        tracing::info!(id, "p2p-client: login");
        let backends = self.backends.clone();
        let opts = self.opts.clone();
        tokio::spawn(async move {
            run_backend(opts, backends, control, id).await;
        });
    }

    fn remove_client(&self, id: u32) {
        if self.backends.shutdown(id) {
            tracing::info!(id, "p2p-client: logout");
        } else {
            tracing::debug!(id, "p2p-client: logout for unknown connection");
        }
    }
}

async fn run_backend(opts: ClientOptions, backends: Arc<ConnTable>, control: Arc<Session>, id: u32) {
    let addr = opts.backend_addr.as_str();
    let stream = match tokio::time::timeout(opts.dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(err)) => {
            tracing::error!(id, backend = %addr, err = %err, "p2p-client: backend dial failed");
            return;
        }
        Err(_) => {
            tracing::error!(id, backend = %addr, "p2p-client: backend dial timed out");
            return;
        }
    };

    if !control.is_running() {
        return;
    }

    let sess = Arc::new(Session::new(stream));
    if let Some(old) = backends.insert(id, sess.clone()) {
        tracing::warn!(id, "p2p-client: duplicate login replaced existing backend");
        old.close();
    }
    metrics::counter!("p2pproxy_connections_total").increment(1);

    let writer = tokio::spawn({
        let sess = sess.clone();
        async move { sess.write_loop().await }
    });

    loop {
        let chunk = tokio::select! {
            _ = control.closed() => break,
            res = sess.read(opts.read_buffer) => match res {
                Ok(c) => c,
                Err(err) => {
                    tracing::debug!(id, err = %err, "p2p-client: backend read failed");
                    break;
                }
            },
        };
        if chunk.is_empty() {
            break;
        }
        metrics::counter!("p2pproxy_bytes_ingress_total").increment(chunk.len() as u64);
        if !control.write_frame(id, Command::Data, &chunk) {
            break;
        }
    }

    // Only the side that removes the entry announces the logout; a backend torn
    // down by a remote LOGOUT was already removed.
    if backends.remove_if_same(id, &sess) {
        control.write_command(FrameHeader::control(id, Command::Logout));
    }
    sess.close();
    let _ = writer.await;
    tracing::debug!(id, "p2p-client: backend closed");
}

/// Sends a TIMER every `interval` and drops the control channel if nothing has
/// been read for `dead_timeout`. Liveness is checked at least once a second.
async fn heartbeat_loop(control: Arc<Session>, interval: Duration, dead_timeout: Duration) {
    let mut check = interval.min(Duration::from_secs(1));
    if !dead_timeout.is_zero() {
        check = check.min(dead_timeout / 4).max(Duration::from_millis(10));
    }
    let mut ticker = tokio::time::interval(check);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_sent = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = control.closed() => return,
            _ = ticker.tick() => {}
        }

        if !dead_timeout.is_zero() && control.is_timeout(dead_timeout) {
            tracing::warn!(
                timeout = %humantime::format_duration(dead_timeout),
                "p2p-client: control channel silent; closing"
            );
            control.close();
            return;
        }
        if last_sent.elapsed() < interval {
            continue;
        }
        last_sent = tokio::time::Instant::now();
        if !control.write_command(FrameHeader::heartbeat()) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::p2pproxy::tunnel::protocol::{HEADER_LEN, decode_header, encode_frame, encode_header};

    fn opts(control: String, backend: String) -> ClientOptions {
        ClientOptions {
            control_addr: control,
            backend_addr: backend,
            dial_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            dead_timeout: Duration::from_secs(120),
            retry_backoff: Duration::from_millis(100),
            read_buffer: 4096,
        }
    }

    async fn read_header(s: &mut TcpStream) -> FrameHeader {
        let mut b = [0u8; HEADER_LEN];
        s.read_exact(&mut b).await.unwrap();
        decode_header(&b).unwrap()
    }

    async fn read_until_data(s: &mut TcpStream, id: u32, want: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < want {
            let h = read_header(s).await;
            let mut payload = vec![0u8; h.length as usize];
            s.read_exact(&mut payload).await.unwrap();
            if h.command == Command::Data && h.id == id {
                out.extend_from_slice(&payload);
            }
        }
        out
    }

    #[test]
    fn new_requires_both_addresses() {
        assert!(P2pClient::new(opts("".into(), "127.0.0.1:1".into())).is_err());
        assert!(P2pClient::new(opts("127.0.0.1:1".into(), " ".into())).is_err());
    }

    #[tokio::test]
    async fn login_data_logout_roundtrip_against_backend() {
        // Backend echoes everything back.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let n = s.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                s.write_all(&buf[..n]).await.unwrap();
            }
        });

        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = Arc::new(P2pClient::new(opts(server_addr.to_string(), backend_addr.to_string())).unwrap());
        let backends = client.backends();
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn({
            let client = client.clone();
            async move { client.run(stop_rx).await }
        });

        let (mut ctl, _) = server.accept().await.unwrap();
        assert!(read_header(&mut ctl).await.is_hello());

        ctl.write_all(&encode_header(&FrameHeader::control(1, Command::Login)))
            .await
            .unwrap();
        for _ in 0..100 {
            if backends.contains(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backends.contains(1));

        ctl.write_all(&encode_frame(1, Command::Data, b"ping")).await.unwrap();
        assert_eq!(read_until_data(&mut ctl, 1, 4).await, b"ping");

        ctl.write_all(&encode_header(&FrameHeader::control(1, Command::Logout)))
            .await
            .unwrap();
        for _ in 0..100 {
            if !backends.contains(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!backends.contains(1));

        stop_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn data_for_unknown_id_keeps_channel_open() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = Arc::new(P2pClient::new(opts(server_addr.to_string(), "127.0.0.1:9".into())).unwrap());
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn({
            let client = client.clone();
            async move { client.run(stop_rx).await }
        });

        let (mut ctl, _) = server.accept().await.unwrap();
        assert!(read_header(&mut ctl).await.is_hello());

        ctl.write_all(&encode_frame(42, Command::Data, b"nobody home")).await.unwrap();
        ctl.write_all(&encode_header(&FrameHeader::heartbeat())).await.unwrap();

        // Still connected: no reconnect shows up on the listener.
        let again = tokio::time::timeout(Duration::from_millis(300), server.accept()).await;
        assert!(again.is_err());

        stop_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn protocol_violation_drops_channel_and_reconnects() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = Arc::new(P2pClient::new(opts(server_addr.to_string(), "127.0.0.1:9".into())).unwrap());
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn({
            let client = client.clone();
            async move { client.run(stop_rx).await }
        });

        let (mut ctl, _) = server.accept().await.unwrap();
        assert!(read_header(&mut ctl).await.is_hello());
        ctl.write_all(&encode_header(&FrameHeader::new(8, 0, Command::Timer)))
            .await
            .unwrap();

        // After the fixed backoff the client dials again and says hello.
        let (mut ctl2, _) = tokio::time::timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(read_header(&mut ctl2).await.is_hello());

        stop_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn retries_forever_while_server_is_unreachable() {
        // Reserve a port, then free it so the first dials are refused.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let client = Arc::new(P2pClient::new(opts(addr.to_string(), "127.0.0.1:9".into())).unwrap());
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn({
            let client = client.clone();
            async move { client.run(stop_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let server = TcpListener::bind(addr).await.unwrap();
        let (mut ctl, _) = tokio::time::timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(read_header(&mut ctl).await.is_hello());

        stop_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn heartbeat_is_sent_on_interval() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut o = opts(server_addr.to_string(), "127.0.0.1:9".into());
        o.heartbeat_interval = Duration::from_millis(50);
        let client = Arc::new(P2pClient::new(o).unwrap());
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn({
            let client = client.clone();
            async move { client.run(stop_rx).await }
        });

        let (mut ctl, _) = server.accept().await.unwrap();
        assert!(read_header(&mut ctl).await.is_hello());
        let h = tokio::time::timeout(Duration::from_secs(2), read_header(&mut ctl))
            .await
            .unwrap();
        assert_eq!(h, FrameHeader::heartbeat());

        stop_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn zero_heartbeat_interval_falls_back_to_default() {
        let mut o = opts("127.0.0.1:1".into(), "127.0.0.1:2".into());
        o.heartbeat_interval = Duration::ZERO;
        let client = P2pClient::new(o).unwrap();
        assert_eq!(client.opts.heartbeat_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn silent_server_with_full_send_buffer_triggers_reconnect() {
        // Backend that floods the tunnel and never reads.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = backend.accept().await.unwrap();
            let chunk = vec![9u8; 64 * 1024];
            while s.write_all(&chunk).await.is_ok() {}
        });

        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut o = opts(server_addr.to_string(), backend_addr.to_string());
        o.dead_timeout = Duration::from_millis(400);
        let client = Arc::new(P2pClient::new(o).unwrap());
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn({
            let client = client.clone();
            async move { client.run(stop_rx).await }
        });

        // Say LOGIN once, then never read or write again.
        let (mut ctl, _) = server.accept().await.unwrap();
        assert!(read_header(&mut ctl).await.is_hello());
        ctl.write_all(&encode_header(&FrameHeader::control(1, Command::Login)))
            .await
            .unwrap();

        let (mut ctl2, _) = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .expect("client reconnected after dead timeout")
            .unwrap();
        assert!(read_header(&mut ctl2).await.is_hello());
        assert!(!client.backends().contains(1));

        stop_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
        drop(ctl);
    }

    #[tokio::test]
    async fn duplicate_login_replaces_backend_without_logout() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let (accepted_tx, mut accepted) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((s, _)) = backend.accept().await {
                if accepted_tx.send(s).is_err() {
                    return;
                }
            }
        });

        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Arc::new(P2pClient::new(opts(server_addr.to_string(), backend_addr.to_string())).unwrap());
        let backends = client.backends();
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn({
            let client = client.clone();
            async move { client.run(stop_rx).await }
        });

        let (mut ctl, _) = server.accept().await.unwrap();
        assert!(read_header(&mut ctl).await.is_hello());

        let login = encode_header(&FrameHeader::control(1, Command::Login));
        ctl.write_all(&login).await.unwrap();
        let mut first = accepted.recv().await.unwrap();
        ctl.write_all(&login).await.unwrap();
        let mut second = accepted.recv().await.unwrap();

        // The replaced backend is closed.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), first.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Its reader must not announce a logout for the id now owned by the new backend.
        let next = tokio::time::timeout(Duration::from_millis(300), read_header(&mut ctl)).await;
        assert!(next.is_err(), "unexpected frame: {next:?}");
        assert!(backends.contains(1));

        // DATA for id 1 reaches the replacement.
        ctl.write_all(&encode_frame(1, Command::Data, b"new")).await.unwrap();
        let mut got = [0u8; 3];
        tokio::time::timeout(Duration::from_secs(2), second.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"new");

        stop_tx.send(true).unwrap();
        run.await.unwrap().unwrap();
    }
}
