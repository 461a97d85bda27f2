//! The hub: every registry and cache the character server owns.
//!
//! A single [`Hub`] lives behind one `tokio::sync::Mutex`; each dispatched
//! message and each timer firing takes the lock, runs to completion and
//! releases it. Hub methods never sleep. Work that must happen later is
//! queued with [`Hub::arm`] and handed to the runtime by [`Hub::take_timers`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::ServerConfig;

use super::aggregate::AggregateCache;
use super::client::ClientSession;
use super::db::Store;
use super::differ::Differ;
use super::dispatch::PacketBuilder;
use super::guild::Guild;
use super::handoff::TicketDirectory;
use super::online::OnlineRegistry;
use super::party::Party;
use super::worker::WorkerRegistry;

/// How often unredeemed tickets are swept.
const TICKET_SWEEP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Shutdown,
}

/// Deferred work, fired by the runtime once its delay has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    WaitingDisconnect { account_id: u32, token: u64 },
    OnlineCleanup,
    TicketSweep,
    GuildFlush,
    PartyFlush,
}

pub struct Hub {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) run_state: RunState,
    pub(crate) online: OnlineRegistry,
    pub(crate) workers: WorkerRegistry,
    pub(crate) tickets: TicketDirectory,
    pub(crate) chars: Differ,
    pub(crate) guilds: AggregateCache<Guild>,
    pub(crate) parties: AggregateCache<Party>,
    /// Latest `0x300A` body per ranking kind.
    pub(crate) rankings: BTreeMap<u8, Vec<u8>>,
    pub(crate) clients: HashMap<u64, ClientSession>,
    upstream: Option<mpsc::Sender<Vec<u8>>>,
    upstream_ready: bool,
    timers: Vec<(Duration, TimerEvent)>,
    next_token: u64,
}

impl Hub {
    pub fn new(store: Arc<dyn Store>, config: Arc<ServerConfig>) -> Self {
        let slots = config.max_map_servers;
        Self {
            store,
            config,
            run_state: RunState::Starting,
            online: OnlineRegistry::new(),
            workers: WorkerRegistry::new(slots),
            tickets: TicketDirectory::new(),
            chars: Differ::new(),
            guilds: AggregateCache::new(),
            parties: AggregateCache::new(),
            rankings: BTreeMap::new(),
            clients: HashMap::new(),
            upstream: None,
            upstream_ready: false,
            timers: Vec::new(),
            next_token: 0,
        }
    }

    /// Clears stale online flags and arms the periodic timers.
    pub async fn start(&mut self) {
        if let Err(e) = self.store.reset_online_flags().await {
            tracing::warn!("[char] [online] could not reset online flags: {}", e);
        }
        self.run_state = RunState::Running;
        let cleanup = Duration::from_secs(self.config.online_cleanup_secs);
        self.arm(cleanup, TimerEvent::OnlineCleanup);
        self.arm(TICKET_SWEEP, TimerEvent::TicketSweep);
        let first = self.config.autosave_interval();
        self.arm(first, TimerEvent::GuildFlush);
        self.arm(first, TimerEvent::PartyFlush);
        tracing::info!(
            "[char] [ready] hub running, {} map server slots",
            self.workers.capacity()
        );
    }

    /// Stops accepting map servers and writes everything still dirty.
    pub async fn shutdown(&mut self) {
        if self.run_state == RunState::Shutdown {
            return;
        }
        self.run_state = RunState::Shutdown;

        let tables = &self.config.tables;
        let g = self.guilds.save_all(self.store.as_ref(), tables).await;
        let p = self.parties.save_all(self.store.as_ref(), tables).await;
        if g + p > 0 {
            tracing::error!("[char] [shutdown] {} guilds and {} parties could not be saved", g, p);
        }
        if let Err(e) = self.store.reset_online_flags().await {
            tracing::warn!("[char] [shutdown] could not reset online flags: {}", e);
        }
        self.send_upstream(super::login::all_offline());
        tracing::info!("[char] [shutdown] hub stopped");
    }

    pub fn is_running(&self) -> bool {
        self.run_state == RunState::Running
    }

    pub fn arm(&mut self, delay: Duration, ev: TimerEvent) {
        self.timers.push((delay, ev));
    }

    pub fn take_timers(&mut self) -> Vec<(Duration, TimerEvent)> {
        std::mem::take(&mut self.timers)
    }

    pub fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    pub async fn fire(&mut self, ev: TimerEvent) {
        if self.run_state == RunState::Shutdown {
            return;
        }
        match ev {
            TimerEvent::WaitingDisconnect { account_id, token } => {
                self.on_waiting_disconnect(account_id, token).await;
            }
            TimerEvent::OnlineCleanup => {
                let period = Duration::from_secs(self.config.online_cleanup_secs);
                self.cleanup_online(Instant::now(), period).await;
                self.arm(period, TimerEvent::OnlineCleanup);
            }
            TimerEvent::TicketSweep => {
                self.sweep_tickets(Instant::now());
                self.arm(TICKET_SWEEP, TimerEvent::TicketSweep);
            }
            TimerEvent::GuildFlush => {
                let budget = self.config.autosave_interval();
                let next = self.guilds.flush_step(self.store.as_ref(), &self.config.tables, budget).await;
                self.arm(next, TimerEvent::GuildFlush);
            }
            TimerEvent::PartyFlush => {
                let budget = self.config.autosave_interval();
                let next = self.parties.flush_step(self.store.as_ref(), &self.config.tables, budget).await;
                self.arm(next, TimerEvent::PartyFlush);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Upstream link
    // -----------------------------------------------------------------------

    /// Installs (or drops) the writer of the login server connection.
    pub fn set_upstream(&mut self, tx: Option<mpsc::Sender<Vec<u8>>>) {
        if tx.is_none() && self.upstream.is_some() {
            tracing::warn!("[char] [logif] login server link lost");
        }
        self.upstream = tx;
        self.upstream_ready = false;
    }

    pub fn upstream_ready(&self) -> bool {
        self.upstream_ready && self.upstream.is_some()
    }

    /// The login server accepted the handshake: resend who is here.
    pub fn upstream_connected(&mut self) {
        self.upstream_ready = true;
        let accounts = self.online.present_accounts();
        tracing::info!(
            "[char] [logif] connected to login server, {} accounts online",
            accounts.len()
        );
        self.send_upstream(super::login::online_list(&accounts));
        self.send_user_count();
    }

    /// Queues a packet for the login server. Dropped while the link is down.
    pub fn send_upstream(&mut self, pkt: Vec<u8>) -> bool {
        if !self.upstream_ready {
            return false;
        }
        let Some(tx) = self.upstream.as_ref() else { return false };
        match tx.try_send(pkt) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("[char] [logif] send queue full, packet dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.set_upstream(None);
                false
            }
        }
    }

    pub fn send_user_count(&mut self) {
        let users = self.workers.total_users();
        self.send_upstream(PacketBuilder::new(0x2714).u32(users).finish());
    }

    // -----------------------------------------------------------------------
    // Clients at character select
    // -----------------------------------------------------------------------

    pub fn send_client(&mut self, session: u64, pkt: Vec<u8>) -> bool {
        let Some(c) = self.clients.get(&session) else { return false };
        match c.tx.try_send(pkt) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("[char] [client] session {} send failed: {}", session, e);
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Guild and party presence
    // -----------------------------------------------------------------------

    fn resident_affiliation(&self, char_id: u32) -> Option<(u32, u32)> {
        self.chars
            .baseline(char_id)
            .map(|c| (c.profile.party_id, c.profile.guild_id))
    }

    async fn affiliation(&self, char_id: u32) -> Option<(u32, u32)> {
        if let Some(a) = self.resident_affiliation(char_id) {
            return Some(a);
        }
        match self.store.load_affiliation(char_id).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("[char] [online] affiliation of char {} not loaded: {}", char_id, e);
                None
            }
        }
    }

    /// A character came online: its guild and party see the member return.
    pub async fn affiliation_online(&mut self, char_id: u32, account_id: u32) {
        let Some((party_id, guild_id)) = self.affiliation(char_id).await else { return };
        if guild_id != 0 {
            self.guild_presence(guild_id, account_id, char_id, true).await;
        }
        if party_id != 0 {
            self.party_presence(party_id, account_id, char_id, true).await;
        }
    }

    pub async fn affiliation_offline(&mut self, char_id: u32) {
        let Some((party_id, guild_id)) = self.affiliation(char_id).await else { return };
        if guild_id != 0 {
            self.guild_presence(guild_id, 0, char_id, false).await;
        }
        if party_id != 0 {
            self.party_presence(party_id, 0, char_id, false).await;
        }
    }

    // -----------------------------------------------------------------------
    // Rankings
    // -----------------------------------------------------------------------

    /// Keeps the latest list of `kind` and pushes it to every map server.
    pub fn update_ranking(&mut self, kind: u8, body: Vec<u8>) {
        let pkt = ranking_packet(&body);
        self.rankings.insert(kind, body);
        let n = self.broadcast(&pkt, None);
        tracing::debug!("[char] [mapif] ranking {} sent to {} map servers", kind, n);
    }

    /// Every known ranking list, for a map server that just connected.
    pub fn ranking_packets(&self) -> Vec<Vec<u8>> {
        self.rankings.values().map(|b| ranking_packet(b)).collect()
    }
}

fn ranking_packet(body: &[u8]) -> Vec<u8> {
    PacketBuilder::variable(0x380D).bytes(body).finish()
}
