//! Wires the frame codec, envelope shim, registry, radio link, interceptor,
//! and injector together: connects the radio, accepts clients, and drives
//! shutdown. Grounded on `MultiClientProxy.start`/`stop` in
//! `multi_client_proxy.py` and `server.rs`'s `start_server` spawn-then-
//! return-`Ok` pattern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::AppContext;
use crate::envelope::{self, DecodedKind};
use crate::frame::FrameCodec;
use crate::interceptor;
use crate::radio::RadioLink;
use crate::registry::ClientRegistry;

const CLIENT_READ_CHUNK: usize = 4096;
const CLIENT_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Runs the proxy until shutdown. Returns `Err` only for startup failure
/// (cannot connect to radio on the first attempt) — the caller maps that
/// to a nonzero exit code.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let registry = Arc::new(ClientRegistry::new());
    let radio = RadioLink::new(config.radio_host.clone(), config.radio_port, running.clone());
    let ctx = AppContext::new(&config, radio.clone(), registry.clone());

    if !radio.connect(ctx.clone()).await {
        anyhow::bail!(
            "failed to connect to radio at {}:{}",
            config.radio_host,
            config.radio_port
        );
    }

    let listener = TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await?;
    info!(
        listen = %format!("{}:{}", config.listen_host, config.listen_port),
        radio = %format!("{}:{}", config.radio_host, config.radio_port),
        channel = config.channel,
        response_delay = config.response_delay,
        "proxy started"
    );

    let accept_task = tokio::spawn(accept_loop(listener, ctx.clone(), running.clone()));

    tokio::select! {
        _ = accept_task => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    running.store(false, Ordering::SeqCst);
    accept_task.abort();
    registry.clear();
    radio.shutdown().await;
    Ok(())
}

/// The accept loop in isolation, split out of [`run`] so tests can drive it
/// against an already-bound loopback listener without also standing up a
/// radio connection or a ctrl-c race.
async fn accept_loop(listener: TcpListener, ctx: Arc<AppContext>, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept().await {
            Ok((stream, addr)) => {
                let (tx, rx) = unbounded_channel::<Vec<u8>>();
                let id = ctx.registry.insert(addr.to_string(), tx);
                info!(id, addr = %addr, population = ctx.registry.len(), "client connected");

                let task_ctx = ctx.clone();
                let task_running = running.clone();
                let handle = tokio::spawn(async move {
                    handle_client(stream, addr.to_string(), id, rx, task_ctx, task_running).await;
                });
                // Registered only after the task exists so shutdown can
                // force-close a client blocked in its read, per the
                // cancellation contract: in-flight reads return via socket
                // close.
                ctx.registry.attach_abort_handle(id, handle.abort_handle());
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}

async fn handle_client(
    stream: tokio::net::TcpStream,
    addr: String,
    id: u64,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    ctx: Arc<AppContext>,
    running: Arc<AtomicBool>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    ctx.radio.wait_ready().await;

    let mut codec = FrameCodec::new();
    let mut buf = [0u8; CLIENT_READ_CHUNK];
    loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match tokio::time::timeout(CLIENT_IDLE_TIMEOUT, read_half.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                for (_, payload) in codec.ingest(&buf[..n]) {
                    if let DecodedKind::UpstreamText(rec) | DecodedKind::DownstreamText(rec) =
                        envelope::try_extract_text(&payload)
                    {
                        interceptor::intercept(rec, ctx.clone());
                    }
                }
                if !ctx.radio.send(&buf[..n]).await {
                    warn!(id, "failed to forward client bytes to radio");
                }
            }
            Ok(Err(_)) => break,
            Err(_) => continue, // idle timeout: liveness poll, not a disconnect
        }
    }

    ctx.registry.remove(id);
    writer_task.abort();
    info!(id, addr = %addr, "client disconnected");
}
