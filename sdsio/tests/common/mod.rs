//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::time::Duration;

use sdsio::protocol::{write_frame, FrameReader};
use sdsio::{Frame, MemKV, MemTransport, SdsioConfig, SdsioServer};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const MAX_PAYLOAD: usize = 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn client_config() -> SdsioConfig {
    SdsioConfig {
        connect_timeout_ms: 500,
        open_timeout_ms: 500,
        read_timeout_ms: 500,
        close_timeout_ms: 500,
        write_timeout_ms: 500,
        max_payload: MAX_PAYLOAD,
        ..SdsioConfig::default()
    }
}

/// An in-memory server on the far end of a `MemTransport`
///
/// Frames sent through `inject` go to the client unsolicited. The server is
/// handed back from `task` once the client disconnects.
pub struct Harness {
    pub inject: mpsc::UnboundedSender<Frame>,
    pub task: JoinHandle<SdsioServer<MemKV>>,
}

pub fn spawn_server() -> (MemTransport, Harness) {
    spawn_server_with(SdsioServer::new(MemKV::new(), MAX_PAYLOAD))
}

pub fn spawn_server_with(mut server: SdsioServer<MemKV>) -> (MemTransport, Harness) {
    let (transport, peer) = MemTransport::pair(64 * 1024);
    let (inject, mut injected) = mpsc::unbounded_channel::<Frame>();
    let task = tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(peer);
        let mut frames = FrameReader::new(reader, MAX_PAYLOAD);
        loop {
            tokio::select! {
                frame = frames.next() => {
                    let Ok(frame) = frame else { break };
                    if let Some(reply) = server.execute(frame).await {
                        if write_frame(&mut writer, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(frame) = injected.recv() => {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        server.clear().await;
        server
    });
    (transport, Harness { inject, task })
}

/// A peer answering each request with whatever `script` returns
pub fn spawn_peer<F>(mut script: F) -> (MemTransport, JoinHandle<()>)
where
    F: FnMut(Frame) -> Option<Frame> + Send + 'static,
{
    let (transport, peer) = MemTransport::pair(64 * 1024);
    let task = tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(peer);
        let mut frames = FrameReader::new(reader, MAX_PAYLOAD);
        while let Ok(frame) = frames.next().await {
            if let Some(reply) = script(frame) {
                if write_frame(&mut writer, &reply).await.is_err() {
                    break;
                }
            }
        }
    });
    (transport, task)
}

/// A connected peer that never says anything
pub fn silent_peer() -> (MemTransport, DuplexStream) {
    MemTransport::pair(64 * 1024)
}

/// A peer that answers the first Open with `server_id`, then stops reading
///
/// `pipe` bytes fit in the channel towards the peer; once they are used up
/// every client frame stays queued.
pub fn stalling_peer(pipe: usize, server_id: u32) -> (MemTransport, JoinHandle<()>) {
    let (transport, peer) = MemTransport::pair(pipe);
    let task = tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(peer);
        let mut frames = FrameReader::new(reader, MAX_PAYLOAD);
        if let Ok(open) = frames.next().await {
            let reply = Frame::open_reply(server_id, open.argument);
            let _ = write_frame(&mut writer, &reply).await;
        }
        // Hold both halves so the client never sees the link drop.
        std::future::pending::<()>().await;
        drop((frames, writer));
    });
    (transport, task)
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub const SHORT: Duration = Duration::from_millis(20);
