//! Owns the single upstream radio socket: connect, handshake, read loop,
//! serialized writer, and reconnect with backoff.
//!
//! Grounded on `connect_to_radio` / `reconnect_to_radio` / `send_to_radio` /
//! `radio_reader_task` in `examples/original_source/proxy/multi_client_proxy.py`,
//! restructured around `server.rs::start_server`'s shape: one `Arc`-shared
//! state struct, one task per concern spawned off it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::envelope::{self, DecodedKind};
use crate::frame::FrameCodec;
use crate::interceptor;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 4096;
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

pub struct RadioLink {
    host: String,
    port: u16,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: AtomicU8,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
    /// Bound once, on the first `connect()`, so write failures and read-loop
    /// EOF can both schedule a reconnect without the caller passing `ctx`
    /// through every call site. `Weak` to avoid a reference cycle with
    /// `AppContext`, which owns this link via `Arc`.
    ctx: OnceCell<Weak<AppContext>>,
    /// Guards against both the write-failure path and the read-loop path
    /// spawning a `reconnect_loop` for the same drop.
    reconnecting: AtomicBool,
    read_task: std::sync::Mutex<Option<AbortHandle>>,
}

impl RadioLink {
    pub fn new(host: String, port: u16, running: Arc<AtomicBool>) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            host,
            port,
            writer: Mutex::new(None),
            state: AtomicU8::new(LinkState::Disconnected as u8),
            ready_tx,
            ready_rx,
            running,
            ctx: OnceCell::new(),
            reconnecting: AtomicBool::new(false),
            read_task: std::sync::Mutex::new(None),
        })
    }

    fn bind_context(&self, ctx: &Arc<AppContext>) {
        let _ = self.ctx.set(Arc::downgrade(ctx));
    }

    /// Schedule a reconnect if the link is still meant to be running and no
    /// reconnect is already in flight. Used by both the read-loop EOF path
    /// and a failed write, so either can trigger recovery the same way.
    fn spawn_reconnect_if_needed(self: &Arc<Self>) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let Some(ctx) = self.ctx.get().and_then(Weak::upgrade) else {
            return;
        };
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(self.clone().reconnect_loop(ctx));
        }
    }

    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::Relaxed) {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Block until the ready latch is set (handshake complete).
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Serialize a write through the single upstream socket. A failed write
    /// transitions the link to `Disconnected` and schedules a reconnect,
    /// the same recovery path as a read-loop EOF.
    pub async fn send(self: &Arc<Self>, bytes: &[u8]) -> bool {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(w) => match w.write_all(bytes).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "radio write failed");
                    *guard = None;
                    drop(guard);
                    self.mark_disconnected();
                    self.spawn_reconnect_if_needed();
                    false
                }
            },
            None => false,
        }
    }

    fn mark_disconnected(&self) {
        self.set_state(LinkState::Disconnected);
        let _ = self.ready_tx.send(false);
    }

    /// Initial connect attempt. On success, spawns the read loop and sends
    /// the handshake. Returns `false` on dial failure/timeout — the caller
    /// treats that as a startup failure and exits nonzero.
    pub async fn connect(self: &Arc<Self>, ctx: Arc<AppContext>) -> bool {
        self.bind_context(&ctx);
        self.set_state(LinkState::Connecting);
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(stream)) => {
                info!(host = %self.host, port = self.port, "connected to radio");
                self.on_connected(stream, ctx).await;
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to connect to radio");
                false
            }
            Err(_) => {
                warn!("timed out connecting to radio");
                false
            }
        }
    }

    async fn on_connected(self: &Arc<Self>, stream: TcpStream, ctx: Arc<AppContext>) {
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.set_state(LinkState::Connected);
        self.reconnecting.store(false, Ordering::SeqCst);

        let read_handle = tokio::spawn({
            let link = self.clone();
            let ctx = ctx.clone();
            async move { link.read_loop(read_half, ctx).await }
        });
        *self.read_task.lock().unwrap() = Some(read_handle.abort_handle());

        let handshake_ok = self.send_handshake().await;
        // Only latch "ready" if the handshake actually went out and the
        // link hasn't already been marked disconnected by that same write
        // failing — otherwise a dead link would reopen a latch a waiting
        // client has no business observing as true.
        if handshake_ok && self.state() == LinkState::Connected {
            let _ = self.ready_tx.send(true);
        }
    }

    async fn send_handshake(self: &Arc<Self>) -> bool {
        let config_id: u32 = loop {
            let v = rand::thread_rng().gen::<u32>();
            if v != 0 {
                break v;
            }
        };
        let payload = envelope::build_want_config(config_id);
        match crate::frame::build(&payload) {
            Ok(frame) => {
                let sent = self.send(&frame).await;
                if sent {
                    info!(config_id, "sent want_config handshake to radio");
                }
                sent
            }
            Err(e) => {
                warn!(error = %e, "failed to build handshake frame");
                false
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: tokio::net::tcp::OwnedReadHalf, ctx: Arc<AppContext>) {
        let mut codec = FrameCodec::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            match reader.read(&mut buf).await {
                Ok(0) => {
                    warn!("radio connection closed");
                    break;
                }
                Ok(n) => {
                    let frames = codec.ingest(&buf[..n]);
                    for (raw, payload) in frames {
                        match envelope::try_extract_text(&payload) {
                            DecodedKind::UpstreamText(rec) | DecodedKind::DownstreamText(rec) => {
                                interceptor::intercept(rec, ctx.clone());
                            }
                            DecodedKind::Other => {}
                        }
                        ctx.registry.broadcast(&raw, None);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "radio read error");
                    break;
                }
            }
        }

        self.mark_disconnected();
        self.spawn_reconnect_if_needed();
    }

    async fn reconnect_loop(self: Arc<Self>, ctx: Arc<AppContext>) {
        let mut backoff = RECONNECT_INITIAL;
        while self.running.load(Ordering::Relaxed) {
            info!(seconds = backoff.as_secs(), "attempting radio reconnection");
            tokio::time::sleep(backoff).await;
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            if self.connect(ctx.clone()).await {
                return;
            }
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Drop the writer and force-close the read half so a blocked
    /// `reader.read()` in `read_loop` returns immediately instead of
    /// waiting on a socket nothing will ever write to again.
    pub async fn shutdown(&self) {
        *self.writer.lock().await = None;
        if let Some(abort) = self.read_task.lock().unwrap().take() {
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::envelope;
    use crate::registry::ClientRegistry;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn link_state_round_trips_through_atomic() {
        let running = Arc::new(AtomicBool::new(true));
        let link = RadioLink::new("127.0.0.1".into(), 0, running);
        assert_eq!(link.state(), LinkState::Disconnected);
        link.set_state(LinkState::Connected);
        assert_eq!(link.state(), LinkState::Connected);
    }

    fn test_config(radio_port: u16) -> Config {
        Config {
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            radio_host: "127.0.0.1".into(),
            radio_port,
            channel: 2,
            response_delay: 0.0,
            debug: false,
        }
    }

    /// S3 — on connect, the radio side receives exactly one frame carrying
    /// an upstream want-configuration record with a nonzero id.
    #[tokio::test]
    async fn handshake_is_sent_immediately_after_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let running = Arc::new(AtomicBool::new(true));
        let link = RadioLink::new(addr.ip().to_string(), addr.port(), running.clone());
        let registry = Arc::new(ClientRegistry::new());
        let ctx = AppContext::new(&test_config(addr.port()), link.clone(), registry);

        assert!(link.connect(ctx).await);
        let received = accept.await.unwrap();

        let mut codec = FrameCodec::new();
        let frames = codec.ingest(&received);
        assert_eq!(frames.len(), 1, "exactly one handshake frame");

        let payload = &frames[0].1;
        assert_eq!(payload[0], envelope::DIR_UPSTREAM);
        let config_id = u32::from_be_bytes(payload[2..6].try_into().unwrap());
        assert_ne!(config_id, 0, "handshake id must be nonzero");

        assert_eq!(link.state(), LinkState::Connected);
    }

    /// A write failure (radio side closed) transitions the link back to
    /// `Disconnected`, the same recovery path as a read-loop EOF.
    #[tokio::test]
    async fn failed_write_marks_link_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let running = Arc::new(AtomicBool::new(true));
        let link = RadioLink::new(addr.ip().to_string(), addr.port(), running.clone());
        let registry = Arc::new(ClientRegistry::new());
        let ctx = AppContext::new(&test_config(addr.port()), link.clone(), registry);

        assert!(link.connect(ctx).await);
        accept.await.unwrap();

        // Keep writing until the peer's close is observed; a single write
        // can race the FIN and still succeed.
        for _ in 0..20 {
            if !link.send(b"probe").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    /// `shutdown()` must force-close the read loop's blocked socket read,
    /// not just drop the writer — otherwise the peer never observes a
    /// closed connection.
    #[tokio::test]
    async fn shutdown_force_closes_the_read_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });

        let running = Arc::new(AtomicBool::new(true));
        let link = RadioLink::new(addr.ip().to_string(), addr.port(), running.clone());
        let registry = Arc::new(ClientRegistry::new());
        let ctx = AppContext::new(&test_config(addr.port()), link.clone(), registry);

        assert!(link.connect(ctx).await);
        let mut peer = accept.await.unwrap();

        // Drain the handshake frame before watching for EOF.
        let mut handshake = [0u8; 10];
        peer.read_exact(&mut handshake).await.unwrap();

        link.shutdown().await;

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .expect("peer should observe EOF once the read loop is aborted")
            .unwrap();
        assert_eq!(n, 0);
    }
}
