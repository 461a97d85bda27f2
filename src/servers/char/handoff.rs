//! Single-use session tickets.
//!
//! A ticket lets exactly one map server accept a player. It is issued with a
//! character when the player picks one, again (mid-transfer) when a map
//! server hands the player to another, and without a character when a map
//! server sends the player back to select. Redemption removes it before the
//! map server is told the result. Account expiration and group outlive the
//! ticket on the online record.

use std::collections::HashMap;
use std::time::Instant;

use super::charstatus::Point;
use super::dispatch::PacketBuilder;
use super::hub::Hub;
use super::online::SlotRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub account_id: u32,
    pub char_id: Option<u32>,
    pub login_id1: u32,
    pub login_id2: u32,
    pub sex: u8,
    pub ip: u32,
    pub expires: Instant,
    /// Account expiration reported by the upstream authority.
    pub expiration_time: u32,
    pub group: u8,
    pub changing_mapservers: bool,
    /// Spawn point for a player handed between map servers.
    pub spawn: Option<Point>,
}

/// What a map server presents when a player connects to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeemRequest {
    pub account_id: u32,
    pub char_id: u32,
    pub login_id1: u32,
    pub login_id2: u32,
    pub sex: u8,
    pub ip: u32,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RedeemError {
    #[error("no ticket")]
    NotFound,

    #[error("ticket {field} mismatch")]
    Mismatch { field: &'static str },

    #[error("ticket expired")]
    Expired,

    #[error("hub is not running")]
    NotRunning,

    #[error("character could not be loaded")]
    NoCharacter,
}

/// At most one live ticket per account.
#[derive(Debug, Default)]
pub struct TicketDirectory {
    tickets: HashMap<u32, Ticket>,
}

impl TicketDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Installs `t`, returning the ticket it replaced.
    pub fn issue(&mut self, t: Ticket) -> Option<Ticket> {
        self.tickets.insert(t.account_id, t)
    }

    pub fn get(&self, account_id: u32) -> Option<&Ticket> {
        self.tickets.get(&account_id)
    }

    pub fn get_mut(&mut self, account_id: u32) -> Option<&mut Ticket> {
        self.tickets.get_mut(&account_id)
    }

    pub fn remove(&mut self, account_id: u32) -> Option<Ticket> {
        self.tickets.remove(&account_id)
    }

    /// Validates `req` against the live ticket. An expired ticket is removed.
    pub fn check(&mut self, req: &RedeemRequest, check_ip: bool, now: Instant) -> Result<&Ticket, RedeemError> {
        let t = self.tickets.get(&req.account_id).ok_or(RedeemError::NotFound)?;
        if t.expires <= now {
            self.tickets.remove(&req.account_id);
            return Err(RedeemError::Expired);
        }
        let field = if t.char_id != Some(req.char_id) {
            Some("character")
        } else if t.login_id1 != req.login_id1 {
            Some("login_id1")
        } else if t.login_id2 != req.login_id2 {
            Some("login_id2")
        } else if check_ip && t.ip != req.ip {
            Some("ip")
        } else {
            None
        };
        match field {
            Some(field) => Err(RedeemError::Mismatch { field }),
            None => self.tickets.get(&req.account_id).ok_or(RedeemError::NotFound),
        }
    }

    /// Drops expired tickets; returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.tickets.len();
        self.tickets.retain(|_, t| t.expires > now);
        before - self.tickets.len()
    }
}

/// `0x3804`
pub fn redeem_failed(req: &RedeemRequest) -> Vec<u8> {
    PacketBuilder::new(0x3804)
        .u32(req.account_id)
        .u32(req.char_id)
        .u32(req.login_id1)
        .u8(req.sex)
        .u32(req.ip)
        .finish()
}

/// Fields of a `0x3003` transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub account_id: u32,
    pub char_id: u32,
    pub login_id1: u32,
    pub login_id2: u32,
    pub sex: u8,
    pub client_ip: u32,
    pub to: Point,
    pub target_ip: u32,
    pub target_port: u16,
}

/// `0x3805`; `login_id1 == 0` tells the map server the transfer was refused.
pub fn transfer_ack(req: &TransferRequest, accepted: bool) -> Vec<u8> {
    PacketBuilder::new(0x3805)
        .u32(req.account_id)
        .u32(req.char_id)
        .u32(if accepted { req.login_id1 } else { 0 })
        .u16(req.to.zone)
        .u16(req.to.x)
        .u16(req.to.y)
        .u32(req.target_ip)
        .u16(req.target_port)
        .finish()
}

impl Hub {
    /// A map server presents a player. On success the ticket is gone and
    /// `slot` owns the character before the map server hears back.
    pub async fn redeem(&mut self, slot: usize, req: RedeemRequest, unattended: bool) -> Result<(), RedeemError> {
        let res = self.try_redeem(slot, &req, unattended).await;
        if let Err(e) = res {
            tracing::warn!(
                "[char] [auth] map server #{} failed to redeem {}:{} ({})",
                slot,
                req.account_id,
                req.char_id,
                e
            );
            self.send_to_slot(slot, redeem_failed(&req));
        }
        res
    }

    async fn try_redeem(&mut self, slot: usize, req: &RedeemRequest, unattended: bool) -> Result<(), RedeemError> {
        if !self.is_running() {
            return Err(RedeemError::NotRunning);
        }
        let check_ip = self.config.check_ticket_ip;
        let ticket = if unattended {
            None
        } else {
            Some(self.tickets.check(req, check_ip, Instant::now())?.clone())
        };

        let mut record = match self.chars.load(self.store.as_ref(), req.char_id).await {
            Ok(Some(r)) if r.account_id == req.account_id => r.clone(),
            Ok(_) => return Err(RedeemError::NoCharacter),
            Err(e) => {
                tracing::warn!("[char] [auth] load of char {} failed: {}", req.char_id, e);
                return Err(RedeemError::NoCharacter);
            }
        };
        if let Some(p) = ticket.as_ref().and_then(|t| t.spawn) {
            record.vitals.last_point = p;
        }
        let body = record.compress().map_err(|_| RedeemError::NoCharacter)?;

        if !unattended {
            self.tickets.remove(req.account_id);
        }
        self.mark_online(slot, req.char_id, req.account_id).await;

        let rec = self.online.ensure(req.account_id);
        rec.sex = req.sex;
        if let Some(t) = &ticket {
            rec.expiration_time = t.expiration_time;
            rec.group = t.group;
        }
        let (expiration, group) = (rec.expiration_time, rec.group);
        let changing = ticket.is_some_and(|t| t.changing_mapservers);
        let pkt = PacketBuilder::variable(0x3803)
            .u32(req.account_id)
            .u32(req.char_id)
            .u32(req.login_id1)
            .u32(req.login_id2)
            .u32(expiration)
            .u8(group)
            .u8(changing as u8)
            .bytes(&body)
            .finish();
        self.send_to_slot(slot, pkt);
        tracing::info!(
            "[char] [auth] char {}:{} accepted by map server #{}{}",
            req.account_id,
            req.char_id,
            slot,
            if unattended { " (unattended)" } else { "" }
        );
        Ok(())
    }

    /// A map server moves a player to another map server. The player is in
    /// transit (unknown owner) until the target redeems the new ticket.
    pub async fn request_transfer(&mut self, slot: usize, req: TransferRequest) -> bool {
        let target = self.workers.find_by_addr(req.target_ip, req.target_port);
        let loaded = match self.chars.load(self.store.as_ref(), req.char_id).await {
            Ok(r) => r.is_some(),
            Err(e) => {
                tracing::warn!("[char] [auth] load of char {} failed: {}", req.char_id, e);
                false
            }
        };
        let accepted = self.is_running() && target.is_some() && loaded;

        if accepted {
            let (expiration_time, group) = self.online.account_data(req.account_id);
            self.tickets.issue(Ticket {
                account_id: req.account_id,
                char_id: Some(req.char_id),
                login_id1: req.login_id1,
                login_id2: req.login_id2,
                sex: req.sex,
                ip: req.client_ip,
                expires: Instant::now() + self.config.ticket_timeout(),
                expiration_time,
                group,
                changing_mapservers: true,
                spawn: Some(req.to),
            });
            self.online.ensure(req.account_id).char_id = Some(req.char_id);
            self.online.rebind(&mut self.workers, req.account_id, SlotRef::Unknown);
            tracing::info!(
                "[char] [auth] char {}:{} moving from map server #{} to #{}",
                req.account_id,
                req.char_id,
                slot,
                target.unwrap_or_default()
            );
        } else {
            tracing::warn!(
                "[char] [auth] transfer of char {}:{} refused (target {}:{})",
                req.account_id,
                req.char_id,
                super::worker::ip_str(req.target_ip),
                req.target_port
            );
        }
        self.send_to_slot(slot, transfer_ack(&req, accepted));
        accepted
    }

    /// A map server sends a player back to character select.
    pub fn return_to_select(&mut self, slot: usize, account_id: u32, login_id1: u32, login_id2: u32, ip: u32) {
        let ok = self.is_running();
        if ok {
            let sex = self.online.get(account_id).map(|r| r.sex).unwrap_or(0);
            let (expiration_time, group) = self.online.account_data(account_id);
            self.tickets.issue(Ticket {
                account_id,
                char_id: None,
                login_id1,
                login_id2,
                sex,
                ip,
                expires: Instant::now() + self.config.ticket_timeout(),
                expiration_time,
                group,
                changing_mapservers: false,
                spawn: None,
            });
            self.begin_char_select(account_id);
            self.online.ensure(account_id).pincode_ok = true;
        }
        let pkt = PacketBuilder::new(0x380B).u32(account_id).u8(ok as u8).finish();
        self.send_to_slot(slot, pkt);
    }

    pub fn sweep_tickets(&mut self, now: Instant) {
        let n = self.tickets.sweep(now);
        if n > 0 {
            tracing::debug!("[char] [auth] {} unredeemed tickets expired", n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::char::charstatus::sample;
    use crate::servers::char::dispatch::PacketReader;
    use crate::servers::char::db::MemoryStore;
    use crate::servers::char::hub::tests::{hub_on, hub_with_worker};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    async fn hub_with_char() -> (Hub, Receiver<Vec<u8>>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_char(sample(7, 42));
        hub_on(store).await
    }

    fn ticket(aid: u32, cid: Option<u32>) -> Ticket {
        Ticket {
            account_id: aid,
            char_id: cid,
            login_id1: 100,
            login_id2: 200,
            sex: 1,
            ip: 0x7F000001,
            expires: Instant::now() + Duration::from_secs(60),
            expiration_time: 0,
            group: 0,
            changing_mapservers: false,
            spawn: None,
        }
    }

    fn request(aid: u32, cid: u32) -> RedeemRequest {
        RedeemRequest { account_id: aid, char_id: cid, login_id1: 100, login_id2: 200, sex: 1, ip: 0x0A000001 }
    }

    /// Expiration, group and the changing-map-servers flag of a `0x3803`.
    fn redeemed_account_data(pkt: &[u8]) -> (u32, u8, u8) {
        let mut rd = PacketReader::variable(pkt);
        for _ in 0..4 {
            rd.u32().unwrap();
        }
        (rd.u32().unwrap(), rd.u8().unwrap(), rd.u8().unwrap())
    }

    #[test]
    fn test_issue_replaces_prior_ticket() {
        let mut d = TicketDirectory::new();
        assert!(d.issue(ticket(42, None)).is_none());
        let old = d.issue(ticket(42, Some(7))).unwrap();
        assert_eq!(old.char_id, None);
        assert_eq!(d.len(), 1);
        assert_eq!(d.get(42).unwrap().char_id, Some(7));
    }

    #[test]
    fn test_check_fields() {
        let now = Instant::now();
        let mut d = TicketDirectory::new();
        d.issue(ticket(42, Some(7)));
        assert!(d.check(&request(42, 7), false, now).is_ok());
        assert_eq!(
            d.check(&request(42, 8), false, now),
            Err(RedeemError::Mismatch { field: "character" })
        );
        let mut bad = request(42, 7);
        bad.login_id2 = 201;
        assert_eq!(d.check(&bad, false, now), Err(RedeemError::Mismatch { field: "login_id2" }));
        // ip is only compared when configured
        assert_eq!(
            d.check(&request(42, 7), true, now),
            Err(RedeemError::Mismatch { field: "ip" })
        );
        assert_eq!(d.check(&request(43, 7), false, now), Err(RedeemError::NotFound));
        // a mismatch does not consume the ticket
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_expired_ticket() {
        let mut d = TicketDirectory::new();
        d.issue(ticket(42, Some(7)));
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(d.check(&request(42, 7), false, later), Err(RedeemError::Expired));
        assert!(d.is_empty());

        d.issue(ticket(42, Some(7)));
        d.issue(ticket(43, Some(8)));
        assert_eq!(d.sweep(later), 2);
    }

    #[tokio::test]
    async fn test_redeem_is_single_use() {
        let (mut hub, mut rx) = hub_with_char().await;
        hub.tickets.issue(ticket(42, Some(7)));

        assert_eq!(hub.redeem(0, request(42, 7), false).await, Ok(()));
        assert!(hub.tickets.get(42).is_none());
        let ok = rx.try_recv().unwrap();
        assert_eq!(&ok[..2], &[0x03, 0x38]);
        let mut rd = PacketReader::variable(&ok);
        assert_eq!(rd.u32().unwrap(), 42);
        assert_eq!(rd.u32().unwrap(), 7);

        assert_eq!(hub.redeem(0, request(42, 7), false).await, Err(RedeemError::NotFound));
        let fail = rx.try_recv().unwrap();
        assert_eq!(&fail[..2], &[0x04, 0x38]);
        assert_eq!(fail.len(), 19);
        assert_eq!(hub.workers.users(0), 1);
    }

    #[tokio::test]
    async fn test_unattended_skips_ticket() {
        let (mut hub, mut rx) = hub_with_char().await;
        assert_eq!(hub.redeem(0, request(42, 7), true).await, Ok(()));
        assert_eq!(&rx.try_recv().unwrap()[..2], &[0x03, 0x38]);
        assert_eq!(hub.online.get(42).unwrap().slot, SlotRef::Slot(0));
    }

    #[tokio::test]
    async fn test_missing_character_keeps_ticket() {
        let (mut hub, _rx) = hub_on(Arc::new(MemoryStore::new())).await;
        hub.tickets.issue(ticket(42, Some(7)));
        assert_eq!(hub.redeem(0, request(42, 7), false).await, Err(RedeemError::NoCharacter));
        assert!(hub.tickets.get(42).is_some());
        assert!(hub.online.get(42).is_none());
    }

    #[tokio::test]
    async fn test_transfer_puts_player_in_transit() {
        let (mut hub, mut rx0) = hub_with_worker().await;
        let (tx1, mut rx1) = tokio::sync::mpsc::channel(16);
        let s1 = hub.register(9, tx1, "mapid", "mappw", 0x0A000002, 5122).unwrap();
        hub.tickets.issue(Ticket { expiration_time: 1234, group: 5, ..ticket(42, Some(7)) });
        hub.redeem(0, request(42, 7), false).await.unwrap();
        while rx0.try_recv().is_ok() {}

        let to = Point { zone: 9, x: 50, y: 60 };
        let req = TransferRequest {
            account_id: 42,
            char_id: 7,
            login_id1: 300,
            login_id2: 400,
            sex: 1,
            client_ip: 0x0A000001,
            to,
            target_ip: 0x0A000002,
            target_port: 5122,
        };
        assert!(hub.request_transfer(0, req).await);
        let ack = rx0.try_recv().unwrap();
        assert_eq!(&ack[..2], &[0x05, 0x38]);
        assert_eq!(ack.len(), 26);
        assert_eq!(hub.online.get(42).unwrap().slot, SlotRef::Unknown);
        assert_eq!(hub.workers.users(0), 0);
        let t = hub.tickets.get(42).unwrap();
        assert!(t.changing_mapservers);
        assert_eq!(t.spawn, Some(to));
        assert_eq!((t.expiration_time, t.group), (1234, 5));

        let mut r = request(42, 7);
        r.login_id1 = 300;
        r.login_id2 = 400;
        hub.redeem(s1, r, false).await.unwrap();
        assert_eq!(hub.workers.users(s1), 1);
        let ok = rx1.try_recv().unwrap();
        assert_eq!(&ok[..2], &[0x03, 0x38]);
        assert_eq!(redeemed_account_data(&ok), (1234, 5, 1));
    }

    #[tokio::test]
    async fn test_player_walks_from_select_to_map_and_back_out() {
        let (mut hub, _rx0) = hub_with_char().await;
        let (tx1, mut rx1) = tokio::sync::mpsc::channel(64);
        let s1 = hub.register(9, tx1, "mapid", "mappw", 0x0A000002, 5122).unwrap();
        hub.publish_zones(s1, vec![3]);
        let (up_tx, _rx_up) = tokio::sync::mpsc::channel(64);
        hub.set_upstream(Some(up_tx));
        hub.upstream_connected();
        let (client_tx, mut rx_client) = tokio::sync::mpsc::channel(16);
        hub.client_connected(900, client_tx, 0x7F000001);

        hub.client_enter(900, 42, 100, 200, 1).await;
        hub.auth_reply(900, 42, 100, 200, 1, 0, 1234, 5).await;
        hub.client_select(900, 1).await;
        let redirect = std::iter::from_fn(|| rx_client.try_recv().ok()).last().unwrap();
        assert_eq!(&redirect[..2], &[0x71, 0x00]);
        hub.close_client(900).await;
        let rec = hub.online.get(42).unwrap();
        assert_eq!((rec.char_id, rec.slot), (Some(7), SlotRef::Unknown));

        while rx1.try_recv().is_ok() {}
        let req = RedeemRequest { ip: 0x7F000001, ..request(42, 7) };
        assert_eq!(hub.redeem(s1, req, false).await, Ok(()));
        assert!(hub.tickets.is_empty());
        let rec = hub.online.get(42).unwrap();
        assert_eq!((rec.char_id, rec.slot), (Some(7), SlotRef::Slot(s1)));
        assert_eq!(hub.workers.users(s1), 1);
        let ok = rx1.try_recv().unwrap();
        assert_eq!(redeemed_account_data(&ok), (1234, 5, 0));

        hub.worker_disconnected(s1, 9);
        assert_eq!(hub.online.get(42).unwrap().slot, SlotRef::Unknown);
        assert_eq!(hub.workers.users(s1), 0);

        hub.mark_offline(None, 42).await;
        assert!(hub.online.get(42).is_none());
    }

    #[tokio::test]
    async fn test_transfer_to_unknown_target_is_refused() {
        let (mut hub, mut rx0) = hub_with_char().await;
        let req = TransferRequest {
            account_id: 42,
            char_id: 7,
            login_id1: 300,
            login_id2: 400,
            sex: 1,
            client_ip: 1,
            to: Point::default(),
            target_ip: 99,
            target_port: 1,
        };
        assert!(!hub.request_transfer(0, req).await);
        let ack = rx0.try_recv().unwrap();
        assert_eq!(&ack[10..14], &0u32.to_le_bytes());
        assert!(hub.tickets.get(42).is_none());
    }

    #[tokio::test]
    async fn test_return_to_select() {
        let (mut hub, mut rx0) = hub_with_char().await;
        hub.tickets.issue(ticket(42, Some(7)));
        hub.redeem(0, request(42, 7), false).await.unwrap();
        while rx0.try_recv().is_ok() {}

        hub.return_to_select(0, 42, 111, 222, 1);
        let ack = rx0.try_recv().unwrap();
        assert_eq!(ack, vec![0x0B, 0x38, 42, 0, 0, 0, 1]);
        let rec = hub.online.get(42).unwrap();
        assert_eq!(rec.slot, SlotRef::NotConnected);
        assert!(rec.pincode_ok);
        let t = hub.tickets.get(42).unwrap();
        assert_eq!((t.char_id, t.login_id1, t.login_id2), (None, 111, 222));
        assert_eq!(hub.workers.users(0), 0);
    }
}
