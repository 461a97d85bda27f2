//! Game clients at character select.
//!
//! A client enters with the secrets the login server gave it. The hub either
//! recognises them from a ticket (a player coming back from a map server,
//! which consumes the ticket) or asks the login server to confirm them; once
//! accepted the client sees its character list, picks one and is redirected
//! to the owning map server with a fresh ticket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::charstatus::NAME_LENGTH;
use super::dispatch::{DispatchError, FrameReader, LengthTable, PacketBuilder, PacketReader};
use super::handoff::Ticket;
use super::hub::Hub;
use super::online::{disconnect_player, SlotRef};
use super::CharState;

const fn clif_lens() -> [i32; 0x0188 - 0x0065] {
    let mut l = [0; 0x0188 - 0x0065];
    l[0x0065 - 0x0065] = 17;
    l[0x0066 - 0x0065] = 3;
    l[0x0187 - 0x0065] = 6;
    l
}

static CLIF_LENS: [i32; 0x0188 - 0x0065] = clif_lens();

pub static CLIF: LengthTable = LengthTable { link: "client", base: 0x0065, lens: &CLIF_LENS };

pub const NOTICE_SERVER_CLOSED: u8 = 1;
pub const NOTICE_ALREADY_ONLINE: u8 = 2;

/// `0x006C` refusal code.
pub const REFUSE_REJECTED: u8 = 0;

/// `0x0081`
pub fn notice(code: u8) -> Vec<u8> {
    PacketBuilder::new(0x0081).u8(code).finish()
}

fn refuse(code: u8) -> Vec<u8> {
    PacketBuilder::new(0x006C).u8(code).finish()
}

#[derive(Debug)]
pub struct ClientSession {
    pub id: u64,
    pub tx: mpsc::Sender<Vec<u8>>,
    pub account_id: u32,
    pub login_id1: u32,
    pub login_id2: u32,
    pub sex: u8,
    pub ip: u32,
    /// Confirmed by a ticket or the login server.
    pub accepted: bool,
}

impl Hub {
    pub fn client_connected(&mut self, session: u64, tx: mpsc::Sender<Vec<u8>>, ip: u32) {
        self.clients.insert(
            session,
            ClientSession { id: session, tx, account_id: 0, login_id1: 0, login_id2: 0, sex: 0, ip, accepted: false },
        );
    }

    /// Forgets a session. An account still at character select goes offline.
    pub async fn close_client(&mut self, session: u64) {
        let Some(c) = self.clients.remove(&session) else { return };
        if !c.accepted {
            return;
        }
        let aid = c.account_id;
        let Some(rec) = self.online.get_mut(aid) else { return };
        if rec.client != Some(session) {
            return;
        }
        rec.client = None;
        if rec.char_id.is_none() && rec.slot == SlotRef::NotConnected {
            self.mark_offline(None, aid).await;
        }
        tracing::debug!("[char] [client] session {} of account {} closed", session, aid);
    }

    /// `0x0065`
    pub async fn client_enter(&mut self, session: u64, account_id: u32, login_id1: u32, login_id2: u32, sex: u8) {
        let Some(c) = self.clients.get_mut(&session) else { return };
        c.account_id = account_id;
        c.login_id1 = login_id1;
        c.login_id2 = login_id2;
        c.sex = sex;
        let ip = c.ip;

        if !self.is_running() {
            self.send_client(session, refuse(REFUSE_REJECTED));
            self.close_client(session).await;
            return;
        }

        let check_ip = self.config.check_ticket_ip;
        let returning = self.tickets.get(account_id).is_some_and(|t| {
            t.login_id1 == login_id1
                && t.login_id2 == login_id2
                && t.sex == sex
                && t.expires > Instant::now()
                && (!check_ip || t.ip == ip)
        });
        if returning {
            if let Some(t) = self.tickets.remove(account_id) {
                tracing::debug!("[char] [client] account {} back from a map server", account_id);
                self.accept_client(session, t.expiration_time, t.group).await;
                return;
            }
        }

        if !self.upstream_ready() {
            tracing::warn!("[char] [client] account {} refused, login server not connected", account_id);
            self.send_client(session, refuse(REFUSE_REJECTED));
            self.close_client(session).await;
            return;
        }
        self.send_upstream(super::login::forward_auth(account_id, login_id1, login_id2, sex, ip, session as u32));
    }

    /// `0x2713`: the login server's verdict on a forwarded enter.
    #[allow(clippy::too_many_arguments)]
    pub async fn auth_reply(
        &mut self,
        request: u32,
        account_id: u32,
        login_id1: u32,
        login_id2: u32,
        sex: u8,
        result: u8,
        expiration_time: u32,
        group: u8,
    ) {
        let found = self
            .clients
            .values_mut()
            .find(|c| {
                c.id as u32 == request
                    && c.account_id == account_id
                    && (c.login_id1, c.login_id2) == (login_id1, login_id2)
                    && !c.accepted
            })
            .map(|c| {
                c.sex = sex;
                c.id
            });
        let Some(session) = found else {
            tracing::debug!("[char] [auth] reply for vanished request {} (account {})", request, account_id);
            return;
        };
        if result != 0 {
            tracing::info!("[char] [auth] login server refused account {} ({})", account_id, result);
            self.send_client(session, refuse(REFUSE_REJECTED));
            self.close_client(session).await;
            return;
        }
        self.accept_client(session, expiration_time, group).await;
    }

    async fn accept_client(&mut self, session: u64, expiration_time: u32, group: u8) {
        let Some(c) = self.clients.get(&session) else { return };
        let aid = c.account_id;

        let owner = self.online.get(aid).map(|r| (r.char_id, r.slot, r.client, r.waiting_disconnect.is_some()));
        if let Some((cid, slot, client, waiting)) = owner {
            let on_map = matches!(slot, SlotRef::Slot(_)) || (slot == SlotRef::Unknown && cid.is_some());
            let elsewhere = client.is_some_and(|other| other != session && self.clients.contains_key(&other));
            if on_map || elsewhere {
                tracing::info!("[char] [client] account {} is already online, refusing", aid);
                if let SlotRef::Slot(s) = slot {
                    self.send_to_slot(s, disconnect_player(aid, cid.unwrap_or(0), 2));
                }
                if on_map && !waiting {
                    self.arm_waiting_disconnect(aid);
                }
                self.send_client(session, notice(NOTICE_ALREADY_ONLINE));
                self.close_client(session).await;
                return;
            }
        }

        let sex = match self.clients.get_mut(&session) {
            Some(c) => {
                c.accepted = true;
                c.sex
            }
            None => return,
        };
        self.begin_char_select(aid);
        let rec = self.online.ensure(aid);
        rec.client = Some(session);
        rec.sex = sex;
        rec.expiration_time = expiration_time;
        rec.group = group;
        self.send_upstream(PacketBuilder::new(0x2716).u32(aid).finish());

        let list = match self.store.load_char_list(aid).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("[char] [client] char list of account {} not loaded: {}", aid, e);
                Vec::new()
            }
        };
        let mut b = PacketBuilder::variable(0x006B).u8(list.len() as u8);
        for s in &list {
            b = b.u32(s.char_id).u8(s.slot).str_fixed(&s.name, NAME_LENGTH);
        }
        self.send_client(session, b.finish());
        tracing::info!("[char] [client] account {} at character select ({} characters)", aid, list.len());
    }

    /// `0x0066`
    pub async fn client_select(&mut self, session: u64, slot_no: u8) {
        let Some(c) = self.clients.get(&session).filter(|c| c.accepted) else { return };
        let (aid, l1, l2, sex, ip) = (c.account_id, c.login_id1, c.login_id2, c.sex, c.ip);

        let list = match self.store.load_char_list(aid).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("[char] [client] char list of account {} not loaded: {}", aid, e);
                return;
            }
        };
        let Some(cid) = list.iter().find(|s| s.slot == slot_no).map(|s| s.char_id) else {
            tracing::debug!("[char] [client] account {} picked empty slot {}", aid, slot_no);
            return;
        };
        let zone = match self.chars.load(self.store.as_ref(), cid).await {
            Ok(Some(r)) => r.vitals.last_point.zone,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("[char] [client] char {} not loaded: {}", cid, e);
                return;
            }
        };

        let owner = self.find_owner(zone);
        let target = owner.filter(|&s| self.workers.is_alive(s)).and_then(|s| self.workers.addr(s));
        let Some((map_ip, map_port)) = target else {
            if let Some(dead) = owner {
                self.reset_worker(dead);
            }
            tracing::warn!("[char] [client] no map server for zone {} (char {})", zone, cid);
            self.send_client(session, notice(NOTICE_SERVER_CLOSED));
            return;
        };

        let (expiration_time, group) = self.online.account_data(aid);
        self.tickets.issue(Ticket {
            account_id: aid,
            char_id: Some(cid),
            login_id1: l1,
            login_id2: l2,
            sex,
            ip,
            expires: Instant::now() + self.config.ticket_timeout(),
            expiration_time,
            group,
            changing_mapservers: false,
            spawn: None,
        });
        self.online.ensure(aid).char_id = Some(cid);
        self.online.rebind(&mut self.workers, aid, SlotRef::Unknown);

        let pkt = PacketBuilder::new(0x0071).u32(cid).u16(zone).u32(map_ip).u16(map_port).finish();
        self.send_client(session, pkt);
        tracing::info!("[char] [client] char {}:{} sent to map server for zone {}", aid, cid, zone);
    }
}

pub async fn dispatch(hub: &mut Hub, session: u64, pkt: &[u8]) -> Result<(), DispatchError> {
    let mut rd = PacketReader::new(pkt);
    match rd.cmd() {
        0x0065 => {
            let aid = rd.u32()?;
            let l1 = rd.u32()?;
            let l2 = rd.u32()?;
            let _reserved = rd.u16()?;
            let sex = rd.u8()?;
            hub.client_enter(session, aid, l1, l2, sex).await;
        }
        0x0066 => {
            let slot = rd.u8()?;
            hub.client_select(session, slot).await;
        }
        0x0187 => {}
        cmd => return Err(DispatchError::UnknownCommand { link: CLIF.link, cmd }),
    }
    Ok(())
}

pub async fn handle_client(state: Arc<CharState>, stream: TcpStream, peer: SocketAddr, prefix: [u8; 2]) {
    let session = state.next_conn_id();
    let (mut rh, wh) = stream.into_split();
    let (tx, rx) = mpsc::channel(super::SEND_QUEUE);
    tokio::spawn(super::write_loop(wh, rx));
    state.hub.lock().await.client_connected(session, tx, super::peer_ipv4(peer));
    tracing::debug!("[char] [client] session {} from {}", session, peer);

    let mut reader = FrameReader::with_prefix(&CLIF, &prefix);
    loop {
        let frame = match reader.read_frame(&mut rh).await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("[char] [client] session {} dropped: {}", session, e);
                break;
            }
        };
        let timers = {
            let mut hub = state.hub.lock().await;
            if !hub.clients.contains_key(&session) {
                break;
            }
            if let Err(e) = dispatch(&mut hub, session, &frame).await {
                tracing::warn!("[char] [client] session {}: {}", session, e);
                hub.close_client(session).await;
                break;
            }
            hub.take_timers()
        };
        super::schedule(&state, timers);
    }

    let timers = {
        let mut hub = state.hub.lock().await;
        hub.close_client(session).await;
        hub.take_timers()
    };
    super::schedule(&state, timers);
}
