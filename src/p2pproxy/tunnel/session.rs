use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc, watch},
};

use crate::p2pproxy::{
    telemetry,
    tunnel::protocol::{self, Command, FrameHeader},
};

/// How long queued bytes may keep draining after `close()`.
pub const CLOSE_LINGER: Duration = Duration::from_millis(500);

enum Outbound {
    Bytes(Bytes),
    Stop,
}

/// One live TCP connection plus its outbound queue.
///
/// Reads happen on the caller's task; writes are queued and drained by
/// [`Session::write_loop`], which must be spawned once per session. Closing is
/// idempotent and wakes both a blocked reader and the writer.
pub struct Session {
    peer: Option<SocketAddr>,
    started: Instant,
    started_at_unix_ms: u64,
    last_read_ms: AtomicU64,
    running: AtomicBool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<Option<(OwnedWriteHalf, mpsc::UnboundedReceiver<Outbound>)>>,
    tx: mpsc::UnboundedSender<Outbound>,
    stop: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        Self {
            peer,
            started: Instant::now(),
            started_at_unix_ms: telemetry::now_unix_ms(),
            last_read_ms: AtomicU64::new(0),
            running: AtomicBool::new(true),
            reader: Mutex::new(rd),
            writer: Mutex::new(Some((wr, rx))),
            tx,
            stop,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn started_at_unix_ms(&self) -> u64 {
        self.started_at_unix_ms
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Reads up to `n` bytes. An empty result means the peer closed the
    /// connection or the session was stopped.
    pub async fn read(&self, n: usize) -> io::Result<Bytes> {
        if !self.is_running() || n == 0 {
            return Ok(Bytes::new());
        }

        let mut stop = self.stop.subscribe();
        let mut rd = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(n);

        let res = {
            let mut limited = (&mut buf).limit(n);
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => None,
                res = rd.read_buf(&mut limited) => Some(res),
            }
        };

        match res {
            None => Ok(Bytes::new()),
            Some(res) => {
                if res? > 0 {
                    self.touch();
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Reads exactly `out.len()` bytes. Returns `Ok(false)` on a clean EOF before
    /// the first byte; EOF in the middle of the buffer is an error.
    pub async fn read_exact(&self, out: &mut [u8]) -> io::Result<bool> {
        let mut have = 0;
        while have < out.len() {
            let chunk = self.read(out.len() - have).await?;
            if chunk.is_empty() {
                if have == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("eof after {have} of {} bytes", out.len()),
                ));
            }
            out[have..have + chunk.len()].copy_from_slice(&chunk);
            have += chunk.len();
        }
        Ok(true)
    }

    /// Queues bytes for the writer. Returns `false` once the session is stopped.
    pub fn write(&self, data: Bytes) -> bool {
        if !self.is_running() {
            return false;
        }
        self.tx.send(Outbound::Bytes(data)).is_ok()
    }

    /// Queues a complete frame as a single enqueue, so frames pushed from
    /// different tasks never interleave on the wire.
    pub fn write_frame(&self, id: u32, command: Command, payload: &[u8]) -> bool {
        let ok = self.write(protocol::encode_frame(id, command, payload));
        if ok {
            metrics::counter!("p2pproxy_frames_total", "command" => command.as_str()).increment(1);
        }
        ok
    }

    pub fn write_command(&self, header: FrameHeader) -> bool {
        self.write_frame(header.id, header.command, &[])
    }

    /// Drains the outbound queue onto the socket until the session stops or a
    /// send fails. Only the first call does anything.
    ///
    /// After `close()`, bytes already queued get [`CLOSE_LINGER`] to reach the
    /// socket; a peer that stopped reading cannot keep the writer alive.
    pub async fn write_loop(&self) {
        let Some((mut wr, mut rx)) = self.writer.lock().await.take() else {
            return;
        };

        let mut stop = self.stop.subscribe();
        let linger = async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
            tokio::time::sleep(CLOSE_LINGER).await;
        };
        tokio::pin!(linger);

        loop {
            let item = tokio::select! {
                item = rx.recv() => item,
                _ = &mut linger => None,
            };
            let Some(Outbound::Bytes(b)) = item else {
                break;
            };
            tokio::select! {
                res = wr.write_all(&b) => {
                    if let Err(err) = res {
                        tracing::debug!(peer = ?self.peer, err = %err, "session: send failed");
                        break;
                    }
                }
                _ = &mut linger => {
                    tracing::debug!(peer = ?self.peer, "session: peer not reading; dropping queued bytes");
                    break;
                }
            }
        }

        self.close();
        // Bounded: the peer may have a full receive window.
        let _ = tokio::time::timeout(CLOSE_LINGER, wr.shutdown()).await;
    }

    /// True if no successful read happened within `window`.
    pub fn is_timeout(&self, window: Duration) -> bool {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_read_ms.load(Ordering::Relaxed);
        now.saturating_sub(last) > window.as_millis() as u64
    }

    pub fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Stop);
            self.stop.send_replace(true);
        }
    }

    /// Resolves once the session has been stopped.
    pub async fn closed(&self) {
        let mut stop = self.stop.subscribe();
        let _ = stop.wait_for(|stopped| *stopped).await;
    }

    fn touch(&self) {
        self.last_read_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}
