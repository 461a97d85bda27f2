//! Link to the login server.
//!
//! The hub connects out, presents its credentials and, once accepted,
//! reports which accounts are present. The link is re-established forever;
//! while it is down nothing is queued for it.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::ServerConfig;

use super::dispatch::{DispatchError, FrameReader, LengthTable, PacketBuilder, PacketReader};
use super::hub::Hub;
use super::online::{disconnect_player, SlotRef};
use super::CharState;

pub static LOGIF: LengthTable = LengthTable {
    link: "login",
    base: 0x2710,
    lens: &[
        0,  // 0x2710
        3,  // 0x2711 handshake ack
        0,  // 0x2712
        25, // 0x2713 auth reply
        0, 0, 0, // 0x2714-0x2716
        52, // 0x2717 account data
        2,  // 0x2718 pong
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x2719-0x2722
        7,  // 0x2723 sex changed
        0, 0, // 0x2724-0x2725
        -1, // 0x2726 account variables
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 0x2727-0x2730
        11, // 0x2731 ban
        0, 0, // 0x2732-0x2733
        6,  // 0x2734 kick
    ],
};

const EMAIL_LENGTH: usize = 40;

// ---------------------------------------------------------------------------
// Hub -> login server
// ---------------------------------------------------------------------------

/// `0x2710`
pub fn handshake(config: &ServerConfig) -> Vec<u8> {
    let ip = config.char_ip.parse::<Ipv4Addr>().map(u32::from).unwrap_or(0);
    PacketBuilder::new(0x2710)
        .str_fixed(&config.login_id, 24)
        .str_fixed(&config.login_pw, 24)
        .u32(ip)
        .u16(config.char_port)
        .str_fixed(&config.server_name, 20)
        .finish()
}

/// `0x2712`; `request` comes back unchanged in the `0x2713` reply.
pub fn forward_auth(account_id: u32, login_id1: u32, login_id2: u32, sex: u8, ip: u32, request: u32) -> Vec<u8> {
    PacketBuilder::new(0x2712)
        .u32(account_id)
        .u32(login_id1)
        .u32(login_id2)
        .u8(sex)
        .u32(ip)
        .u32(request)
        .finish()
}

pub fn ping() -> Vec<u8> {
    PacketBuilder::new(0x2719).finish()
}

pub fn account_online(account_id: u32) -> Vec<u8> {
    PacketBuilder::new(0x272B).u32(account_id).finish()
}

pub fn account_offline(account_id: u32) -> Vec<u8> {
    PacketBuilder::new(0x272C).u32(account_id).finish()
}

/// `0x272D`: every account present on the hub.
pub fn online_list(accounts: &[u32]) -> Vec<u8> {
    let mut b = PacketBuilder::variable(0x272D).u32(accounts.len() as u32);
    for &aid in accounts {
        b = b.u32(aid);
    }
    b.finish()
}

pub fn all_offline() -> Vec<u8> {
    PacketBuilder::new(0x2737).finish()
}

// ---------------------------------------------------------------------------
// Login server -> hub
// ---------------------------------------------------------------------------

impl Hub {
    /// The login server wants the account gone from wherever it is.
    pub async fn kick_account(&mut self, account_id: u32) {
        let state = self.online.get(account_id).map(|r| (r.char_id, r.slot, r.client, r.waiting_disconnect.is_some()));
        match state {
            Some((cid, SlotRef::Slot(slot), _, waiting)) => {
                self.send_to_slot(slot, disconnect_player(account_id, cid.unwrap_or(0), 2));
                if !waiting {
                    self.arm_waiting_disconnect(account_id);
                }
            }
            Some((_, _, Some(session), _)) => {
                self.send_client(session, super::client::notice(super::client::NOTICE_ALREADY_ONLINE));
                self.close_client(session).await;
            }
            Some((cid, _, None, _)) => self.mark_offline(cid, account_id).await,
            None => {}
        }
        self.tickets.remove(account_id);
    }

    /// `0x2717`: refreshes what the live ticket, and every later one, tells
    /// the next map server.
    pub fn account_data(&mut self, account_id: u32, expiration_time: u32, group: u8) {
        if let Some(t) = self.tickets.get_mut(account_id) {
            t.expiration_time = expiration_time;
            t.group = group;
        }
        if let Some(rec) = self.online.get_mut(account_id) {
            rec.expiration_time = expiration_time;
            rec.group = group;
        }
    }
}

/// Handles one frame from the login server.
pub async fn dispatch(hub: &mut Hub, pkt: &[u8]) -> Result<(), DispatchError> {
    let mut rd = PacketReader::new(pkt);
    match rd.cmd() {
        0x2711 => {
            let result = rd.u8()?;
            if result == 0 {
                hub.upstream_connected();
            } else {
                tracing::error!("[char] [logif] login server refused our credentials ({})", result);
            }
        }
        0x2713 => {
            let aid = rd.u32()?;
            let l1 = rd.u32()?;
            let l2 = rd.u32()?;
            let sex = rd.u8()?;
            let result = rd.u8()?;
            let request = rd.u32()?;
            let expiration = rd.u32()?;
            let group = rd.u8()?;
            hub.auth_reply(request, aid, l1, l2, sex, result, expiration, group).await;
        }
        0x2717 => {
            let aid = rd.u32()?;
            let _email = rd.str_fixed(EMAIL_LENGTH)?;
            let expiration = rd.u32()?;
            let group = rd.u8()?;
            let _slots = rd.u8()?;
            hub.account_data(aid, expiration, group);
        }
        0x2718 => {}
        0x2723 => {
            let aid = rd.u32()?;
            let sex = rd.u8()?;
            tracing::info!("[char] [logif] account {} changed sex", aid);
            hub.broadcast(&PacketBuilder::new(0x380A).u32(aid).u8(sex).finish(), None);
        }
        0x2726 => {
            let mut rd = PacketReader::variable(pkt);
            let body = rd.rest();
            hub.broadcast(&PacketBuilder::variable(0x3809).bytes(body).finish(), None);
        }
        0x2731 => {
            let aid = rd.u32()?;
            let kind = rd.u8()?;
            let until = rd.u32()?;
            let when = chrono::DateTime::from_timestamp(i64::from(until), 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".into());
            tracing::info!("[char] [logif] account {} banned (kind {}) until {}", aid, kind, when);
            hub.broadcast(&PacketBuilder::new(0x3808).u32(aid).u8(kind).u32(until).finish(), None);
            hub.kick_account(aid).await;
        }
        0x2734 => {
            let aid = rd.u32()?;
            tracing::info!("[char] [logif] login server kicked account {}", aid);
            hub.kick_account(aid).await;
        }
        cmd => return Err(DispatchError::UnknownCommand { link: LOGIF.link, cmd }),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

/// Keeps the login server link up until the process exits.
pub async fn run(state: Arc<CharState>) {
    let retry = Duration::from_secs(state.config.login_reconnect_secs);
    let addr = format!("{}:{}", state.config.login_ip, state.config.login_port);
    loop {
        tracing::info!("[char] [logif] connecting to login server at {}", addr);
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                if let Err(e) = run_connection(&state, stream).await {
                    tracing::warn!("[char] [logif] login server link error: {}", e);
                }
                state.hub.lock().await.set_upstream(None);
            }
            Err(e) => tracing::warn!("[char] [logif] connect failed: {}", e),
        }
        tokio::time::sleep(retry).await;
    }
}

async fn run_connection(state: &Arc<CharState>, stream: TcpStream) -> Result<(), DispatchError> {
    let (mut rh, wh) = stream.into_split();
    let (tx, rx) = mpsc::channel(super::SEND_QUEUE);
    tx.try_send(handshake(&state.config)).map_err(|_| DispatchError::Io(std::io::ErrorKind::BrokenPipe.into()))?;
    state.hub.lock().await.set_upstream(Some(tx.clone()));
    tokio::spawn(super::write_loop(wh, rx));

    let period = Duration::from_secs(state.config.login_ping_secs);
    let pinger = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(ping()).await.is_err() {
                break;
            }
        }
    });

    let mut reader = FrameReader::new(&LOGIF);
    let res = loop {
        let frame = match reader.read_frame(&mut rh).await {
            Ok(Some(f)) => f,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let timers = {
            let mut hub = state.hub.lock().await;
            if let Err(e) = dispatch(&mut hub, &frame).await {
                break Err(e);
            }
            hub.take_timers()
        };
        super::schedule(state, timers);
    };
    pinger.abort();
    tracing::info!("[char] [logif] login server disconnected");
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::char::charstatus::sample;
    use crate::servers::char::db::MemoryStore;
    use crate::servers::char::dispatch::FrameLen;
    use crate::servers::char::hub::tests::{hub_on, hub_with_worker};
    use crate::servers::char::handoff::Ticket;
    use std::time::Instant;

    fn ticket(aid: u32) -> Ticket {
        Ticket {
            account_id: aid,
            char_id: None,
            login_id1: 1,
            login_id2: 2,
            sex: 0,
            ip: 0,
            expires: Instant::now() + Duration::from_secs(60),
            expiration_time: 0,
            group: 0,
            changing_mapservers: false,
            spawn: None,
        }
    }

    #[test]
    fn test_length_table() {
        assert_eq!(LOGIF.lookup(0x2713), Some(FrameLen::Fixed(25)));
        assert_eq!(LOGIF.lookup(0x2723), Some(FrameLen::Fixed(7)));
        assert_eq!(LOGIF.lookup(0x2726), Some(FrameLen::Variable));
        assert_eq!(LOGIF.lookup(0x2731), Some(FrameLen::Fixed(11)));
        assert_eq!(LOGIF.lookup(0x2734), Some(FrameLen::Fixed(6)));
        assert_eq!(LOGIF.lookup(0x2712), None);
    }

    #[test]
    fn test_outbound_sizes() {
        let config = ServerConfig::test_only();
        assert_eq!(handshake(&config).len(), 76);
        assert_eq!(forward_auth(1, 2, 3, 0, 4, 5).len(), 23);
        assert_eq!(online_list(&[1, 2]), vec![0x2D, 0x27, 18, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_kick_of_mapped_account_waits_for_map_server() {
        let (mut hub, mut rx) = hub_with_worker().await;
        hub.mark_online(0, 7, 42).await;
        while rx.try_recv().is_ok() {}
        hub.take_timers();
        hub.tickets.issue(ticket(42));

        let pkt = PacketBuilder::new(0x2734).u32(42).finish();
        dispatch(&mut hub, &pkt).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), disconnect_player(42, 7, 2));
        assert!(hub.tickets.get(42).is_none());
        assert_eq!(hub.take_timers().len(), 1);
        assert!(hub.online.get(42).is_some());
    }

    #[tokio::test]
    async fn test_kick_of_unmapped_account_is_immediate() {
        let (mut hub, _rx) = hub_on(Arc::new(MemoryStore::new())).await;
        hub.begin_char_select(42);
        hub.kick_account(42).await;
        assert!(hub.online.get(42).is_none());
    }

    #[tokio::test]
    async fn test_ban_is_forwarded_then_kicks() {
        let store = Arc::new(MemoryStore::new());
        store.insert_char(sample(7, 42));
        let (mut hub, mut rx) = hub_on(store).await;
        hub.mark_online(0, 7, 42).await;
        while rx.try_recv().is_ok() {}

        let pkt = PacketBuilder::new(0x2731).u32(42).u8(1).u32(1_700_000_000).finish();
        dispatch(&mut hub, &pkt).await.unwrap();
        assert_eq!(&rx.try_recv().unwrap()[..2], &[0x08, 0x38]);
        assert_eq!(&rx.try_recv().unwrap()[..2], &[0x06, 0x38]);
    }

    #[tokio::test]
    async fn test_account_data_updates_ticket() {
        let (mut hub, _rx) = hub_on(Arc::new(MemoryStore::new())).await;
        hub.tickets.issue(ticket(42));
        let pkt = PacketBuilder::new(0x2717)
            .u32(42)
            .str_fixed("a@b.c", EMAIL_LENGTH)
            .u32(99)
            .u8(3)
            .u8(9)
            .finish();
        assert_eq!(pkt.len(), 52);
        dispatch(&mut hub, &pkt).await.unwrap();
        let t = hub.tickets.get(42).unwrap();
        assert_eq!((t.expiration_time, t.group), (99, 3));
        assert_eq!(hub.tickets.len(), 1);
        assert!(hub.online.get(42).is_none());
    }

    #[tokio::test]
    async fn test_account_data_reaches_online_record() {
        let (mut hub, _rx) = hub_on(Arc::new(MemoryStore::new())).await;
        hub.begin_char_select(42);
        hub.account_data(42, 77, 4);
        assert!(hub.tickets.get(42).is_none());
        let rec = hub.online.get(42).unwrap();
        assert_eq!((rec.expiration_time, rec.group), (77, 4));
    }

    #[tokio::test]
    async fn test_variable_sync_passes_through() {
        let (mut hub, mut rx) = hub_on(Arc::new(MemoryStore::new())).await;
        let pkt = PacketBuilder::variable(0x2726).u32(42).bytes(b"opaque").finish();
        dispatch(&mut hub, &pkt).await.unwrap();
        let out = rx.try_recv().unwrap();
        assert_eq!(&out[..2], &[0x09, 0x38]);
        assert_eq!(&out[6..], &pkt[6..]);
    }
}
