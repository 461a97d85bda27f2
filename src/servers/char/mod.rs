//! Character hub.
//!
//! One listener accepts both map servers and game clients; the first packet
//! id tells them apart. Every connection task locks the shared [`Hub`] per
//! frame and hands any timers the frame armed to [`schedule`].

pub mod aggregate;
pub mod charstatus;
pub mod client;
pub mod db;
pub mod differ;
pub mod dispatch;
pub mod guild;
pub mod handoff;
pub mod hub;
pub mod login;
pub mod map;
pub mod online;
pub mod party;
pub mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::config::ServerConfig;

use db::Store;
use hub::{Hub, TimerEvent};

/// Outbound queue depth per connection.
pub const SEND_QUEUE: usize = 256;

pub struct CharState {
    pub hub: Mutex<Hub>,
    pub config: Arc<ServerConfig>,
    next_conn: AtomicU64,
}

impl CharState {
    pub fn new(store: Arc<dyn Store>, config: ServerConfig) -> Self {
        let config = Arc::new(config);
        Self {
            hub: Mutex::new(Hub::new(store, Arc::clone(&config))),
            config,
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Moves the hub to running and starts its periodic timers.
    pub async fn start(state: &Arc<Self>) {
        let timers = {
            let mut hub = state.hub.lock().await;
            hub.start().await;
            hub.take_timers()
        };
        schedule(state, timers);
    }

    pub async fn shutdown(&self) {
        self.hub.lock().await.shutdown().await;
    }

    pub async fn run(state: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("[char] [ready] listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let s = Arc::clone(&state);
            tokio::spawn(async move {
                handle_new_connection(s, stream, peer).await;
            });
        }
    }
}

async fn handle_new_connection(state: Arc<CharState>, mut stream: TcpStream, peer: SocketAddr) {
    let mut cmd_bytes = [0u8; 2];
    if stream.read_exact(&mut cmd_bytes).await.is_err() {
        return;
    }
    match u16::from_le_bytes(cmd_bytes) {
        0x3000 => map::handle_map_server(state, stream, cmd_bytes).await,
        0x0065 => client::handle_client(state, stream, peer, cmd_bytes).await,
        cmd => tracing::warn!("[char] unknown first packet 0x{:04X} from {}", cmd, peer),
    }
}

/// Spawns one sleeper per timer. A fired timer may arm more.
pub(crate) fn schedule(state: &Arc<CharState>, timers: Vec<(Duration, TimerEvent)>) {
    for (delay, ev) in timers {
        let s = Arc::clone(state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let more = {
                let mut hub = s.hub.lock().await;
                hub.fire(ev).await;
                hub.take_timers()
            };
            schedule(&s, more);
        });
    }
}

/// Drains a connection's queue into the socket. The write side is shut
/// down once every sender is gone.
pub(crate) async fn write_loop(mut wh: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(msg) = rx.recv().await {
        if wh.write_all(&msg).await.is_err() {
            return;
        }
    }
    let _ = wh.shutdown().await;
}

pub(crate) fn peer_ipv4(peer: SocketAddr) -> u32 {
    match peer {
        SocketAddr::V4(a) => u32::from(*a.ip()),
        SocketAddr::V6(a) => a.ip().to_ipv4_mapped().map(u32::from).unwrap_or(0),
    }
}
