//! Per-account online state.
//!
//! One [`OnlineRecord`] per account says which character is selected and
//! which map-server slot owns it. Slot user counts are only ever adjusted by
//! [`OnlineRegistry::rebind`], so they always equal the number of records
//! pointing at the slot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::dispatch::PacketBuilder;
use super::hub::{Hub, TimerEvent};
use super::worker::WorkerRegistry;

/// Which map server, if any, owns an account's character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    NotConnected,
    /// Owning map server went away or the character is between map servers.
    Unknown,
    Slot(usize),
}

#[derive(Debug, Clone)]
pub struct OnlineRecord {
    pub account_id: u32,
    pub char_id: Option<u32>,
    pub slot: SlotRef,
    /// Hub-side client session at character select.
    pub client: Option<u64>,
    /// Token of the pending forced-disconnect timer.
    pub waiting_disconnect: Option<u64>,
    pub pincode_ok: bool,
    pub unknown_since: Option<Instant>,
    /// Account data from the login server, carried into every ticket
    /// issued for this account.
    pub sex: u8,
    pub expiration_time: u32,
    pub group: u8,
}

impl OnlineRecord {
    fn new(account_id: u32) -> Self {
        Self {
            account_id,
            char_id: None,
            slot: SlotRef::NotConnected,
            client: None,
            waiting_disconnect: None,
            pincode_ok: false,
            unknown_since: None,
            sex: 0,
            expiration_time: 0,
            group: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct OnlineRegistry {
    records: HashMap<u32, OnlineRecord>,
}

impl OnlineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, account_id: u32) -> Option<&OnlineRecord> {
        self.records.get(&account_id)
    }

    pub fn get_mut(&mut self, account_id: u32) -> Option<&mut OnlineRecord> {
        self.records.get_mut(&account_id)
    }

    pub fn ensure(&mut self, account_id: u32) -> &mut OnlineRecord {
        self.records.entry(account_id).or_insert_with(|| OnlineRecord::new(account_id))
    }

    /// Expiration and group last reported for `account_id`.
    pub fn account_data(&self, account_id: u32) -> (u32, u8) {
        self.records.get(&account_id).map(|r| (r.expiration_time, r.group)).unwrap_or((0, 0))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OnlineRecord> {
        self.records.values()
    }

    /// Removes a record, releasing its slot first.
    pub fn remove(&mut self, workers: &mut WorkerRegistry, account_id: u32) -> Option<OnlineRecord> {
        self.rebind(workers, account_id, SlotRef::NotConnected);
        self.records.remove(&account_id)
    }

    /// Moves a record to `to`, keeping slot user counts in step.
    pub fn rebind(&mut self, workers: &mut WorkerRegistry, account_id: u32, to: SlotRef) {
        let Some(rec) = self.records.get_mut(&account_id) else { return };
        if rec.slot == to {
            return;
        }
        if let SlotRef::Slot(s) = rec.slot {
            workers.remove_user(s);
        }
        if let SlotRef::Slot(s) = to {
            workers.add_user(s);
        }
        rec.unknown_since = (to == SlotRef::Unknown).then(Instant::now);
        rec.slot = to;
    }

    /// Marks every record owned by `slot` as unknown; returns how many.
    pub fn detach_slot(&mut self, workers: &mut WorkerRegistry, slot: usize) -> usize {
        let ids: Vec<u32> = self
            .records
            .values()
            .filter(|r| r.slot == SlotRef::Slot(slot))
            .map(|r| r.account_id)
            .collect();
        for &aid in &ids {
            self.rebind(workers, aid, SlotRef::Unknown);
        }
        ids.len()
    }

    /// Accounts the upstream authority should consider logged in.
    pub fn present_accounts(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self
            .records
            .values()
            .filter(|r| matches!(r.slot, SlotRef::Slot(_)) || r.client.is_some())
            .map(|r| r.account_id)
            .collect();
        v.sort_unstable();
        v
    }
}

/// `0x3806`: ask a map server to drop a player.
pub fn disconnect_player(account_id: u32, char_id: u32, reason: u8) -> Vec<u8> {
    PacketBuilder::new(0x3806).u32(account_id).u32(char_id).u8(reason).finish()
}

impl Hub {
    /// The account is at character select: no map server owns it anymore.
    pub fn begin_char_select(&mut self, account_id: u32) {
        let rec = self.online.ensure(account_id);
        rec.char_id = None;
        rec.waiting_disconnect = None;
        self.online.rebind(&mut self.workers, account_id, SlotRef::NotConnected);
        self.send_upstream(super::login::account_online(account_id));
    }

    /// `slot` now owns `char_id`. An older owner on another slot is told to
    /// drop the player first.
    pub async fn mark_online(&mut self, slot: usize, char_id: u32, account_id: u32) {
        if let Err(e) = self.store.set_online_flag(account_id, Some(char_id), true).await {
            tracing::warn!("[char] [online] online flag for char {} not saved: {}", char_id, e);
        }

        let rec = self.online.ensure(account_id);
        let previous = (rec.char_id, rec.slot, rec.client);
        if let (Some(old_cid), SlotRef::Slot(old), client) = previous {
            if old != slot {
                tracing::warn!(
                    "[char] [online] char {}:{} marked on map server #{}, but map server #{} claims it; evicting older owner",
                    account_id,
                    old_cid,
                    old,
                    slot
                );
                self.send_to_slot(old, disconnect_player(account_id, old_cid, 2));
                if let Some(session) = client {
                    self.send_client(session, super::client::notice(super::client::NOTICE_ALREADY_ONLINE));
                    self.close_client(session).await;
                }
            }
        }

        let rec = self.online.ensure(account_id);
        rec.char_id = Some(char_id);
        rec.waiting_disconnect = None;
        self.online.rebind(&mut self.workers, account_id, SlotRef::Slot(slot));
        tracing::debug!("[char] [online] char {}:{} on map server #{}", account_id, char_id, slot);

        self.affiliation_online(char_id, account_id).await;
        self.send_upstream(super::login::account_online(account_id));
    }

    /// `char_id = None` logs out every character of the account.
    pub async fn mark_offline(&mut self, char_id: Option<u32>, account_id: u32) {
        if let Err(e) = self.store.set_online_flag(account_id, char_id, false).await {
            tracing::warn!("[char] [online] offline flag for account {} not saved: {}", account_id, e);
        }

        let mut affected = match char_id {
            Some(cid) => vec![cid],
            None => self.chars.account_chars(account_id),
        };
        if char_id.is_none() {
            if let Some(cid) = self.online.get(account_id).and_then(|r| r.char_id) {
                if !affected.contains(&cid) {
                    affected.push(cid);
                }
            }
        }
        for cid in affected {
            self.affiliation_offline(cid).await;
            self.chars.drop_baseline(cid);
        }

        let mut fully_offline = true;
        if let Some(rec) = self.online.get_mut(account_id) {
            rec.waiting_disconnect = None;
            let releases = char_id.is_none() || rec.char_id == char_id;
            if releases {
                rec.char_id = None;
                rec.pincode_ok = false;
            }
            let has_client = rec.client.is_some();
            if releases {
                self.online.rebind(&mut self.workers, account_id, SlotRef::NotConnected);
            }
            fully_offline = !has_client;
            let idle = self
                .online
                .get(account_id)
                .is_some_and(|r| r.char_id.is_none() && r.slot == SlotRef::NotConnected);
            if !has_client && idle {
                self.online.remove(&mut self.workers, account_id);
            }
        }
        if fully_offline {
            self.send_upstream(super::login::account_offline(account_id));
        }
        tracing::debug!("[char] [online] account {} char {:?} offline", account_id, char_id);
    }

    /// Disconnects every record on `slot` (or all records): records owned by
    /// a map server get a disconnect request and a grace timer, the rest are
    /// cleared at once.
    pub async fn kick(&mut self, slot: Option<usize>) {
        let targets: Vec<(u32, Option<u32>, SlotRef, bool)> = self
            .online
            .iter()
            .filter(|r| slot.is_none() || r.slot == SlotRef::Slot(slot.unwrap_or_default()))
            .map(|r| (r.account_id, r.char_id, r.slot, r.waiting_disconnect.is_some()))
            .collect();

        for (aid, cid, owner, waiting) in targets {
            match owner {
                SlotRef::Slot(s) => {
                    self.send_to_slot(s, disconnect_player(aid, cid.unwrap_or(0), 1));
                    if !waiting {
                        self.arm_waiting_disconnect(aid);
                    }
                }
                _ if !waiting => self.mark_offline(cid, aid).await,
                _ => {}
            }
        }
    }

    /// Arms the forced-disconnect grace timer for an account.
    pub fn arm_waiting_disconnect(&mut self, account_id: u32) {
        let token = self.next_token();
        self.online.ensure(account_id).waiting_disconnect = Some(token);
        let delay = self.config.auth_timeout();
        self.arm(delay, TimerEvent::WaitingDisconnect { account_id, token });
    }

    /// Grace timer expired. A stale token means the record moved on.
    pub async fn on_waiting_disconnect(&mut self, account_id: u32, token: u64) {
        let Some(rec) = self.online.get_mut(account_id) else { return };
        if rec.waiting_disconnect != Some(token) {
            return;
        }
        rec.waiting_disconnect = None;
        let cid = rec.char_id;
        tracing::info!("[char] [online] account {} did not disconnect in time, forcing offline", account_id);
        self.mark_offline(cid, account_id).await;
    }

    /// Periodic sweep: characters unknown for a full period go offline,
    /// records with nothing left are dropped.
    pub async fn cleanup_online(&mut self, now: Instant, period: Duration) {
        let stale: Vec<(u32, Option<u32>)> = self
            .online
            .iter()
            .filter(|r| r.client.is_none() && r.slot == SlotRef::Unknown)
            .filter(|r| r.unknown_since.is_some_and(|t| now.saturating_duration_since(t) >= period))
            .map(|r| (r.account_id, r.char_id))
            .collect();
        for (aid, cid) in stale {
            tracing::info!("[char] [online] account {} stuck on unknown map server, setting offline", aid);
            self.mark_offline(cid, aid).await;
        }

        let idle: Vec<u32> = self
            .online
            .iter()
            .filter(|r| r.client.is_none() && r.slot == SlotRef::NotConnected)
            .map(|r| r.account_id)
            .collect();
        for aid in idle {
            self.online.remove(&mut self.workers, aid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::char::hub::tests::{hub_with_worker, running_hub};
    use tokio::sync::mpsc;

    fn assert_counts(hub: &Hub) {
        for slot in 0..hub.workers.capacity() {
            assert_eq!(hub.workers.users(slot) as usize, hub.slot_population(slot));
        }
    }

    #[test]
    fn test_rebind_keeps_counts() {
        let mut workers = WorkerRegistry::new(2);
        let mut online = OnlineRegistry::new();
        online.ensure(1);
        online.ensure(2);
        online.rebind(&mut workers, 1, SlotRef::Slot(0));
        online.rebind(&mut workers, 2, SlotRef::Slot(0));
        assert_eq!(workers.users(0), 2);
        online.rebind(&mut workers, 1, SlotRef::Slot(1));
        assert_eq!((workers.users(0), workers.users(1)), (1, 1));
        // rebinding to the same slot is a no-op
        online.rebind(&mut workers, 1, SlotRef::Slot(1));
        assert_eq!(workers.users(1), 1);
        assert_eq!(online.detach_slot(&mut workers, 0), 1);
        assert_eq!(workers.users(0), 0);
        assert_eq!(online.get(2).unwrap().slot, SlotRef::Unknown);
        assert!(online.get(2).unwrap().unknown_since.is_some());
        online.remove(&mut workers, 1);
        assert_eq!(workers.users(1), 0);
    }

    #[tokio::test]
    async fn test_counts_follow_any_sequence() {
        let (mut hub, _rx0) = hub_with_worker().await;
        let (tx1, _rx1) = mpsc::channel(64);
        hub.register(9, tx1, "mapid", "mappw", 2, 2).unwrap();

        hub.mark_online(0, 7, 42).await;
        assert_counts(&hub);
        hub.mark_online(1, 7, 42).await;
        assert_counts(&hub);
        hub.mark_offline(Some(99), 42).await;
        assert_counts(&hub);
        hub.mark_online(0, 8, 43).await;
        hub.mark_offline(None, 42).await;
        hub.mark_offline(None, 42).await;
        assert_counts(&hub);
        hub.begin_char_select(43);
        assert_counts(&hub);
        assert_eq!(hub.workers.total_users(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_claim_evicts_older_owner() {
        let (mut hub, mut rx0) = hub_with_worker().await;
        let (tx1, _rx1) = mpsc::channel(64);
        let s1 = hub.register(9, tx1, "mapid", "mappw", 2, 2).unwrap();

        hub.mark_online(0, 7, 42).await;
        while rx0.try_recv().is_ok() {}
        hub.mark_online(s1, 7, 42).await;

        let pkt = rx0.try_recv().unwrap();
        assert_eq!(&pkt[..2], &[0x06, 0x38]);
        assert_eq!(hub.online.get(42).unwrap().slot, SlotRef::Slot(s1));
        assert_eq!(hub.workers.users(0), 0);
        assert_eq!(hub.workers.users(s1), 1);
    }

    #[tokio::test]
    async fn test_kick_arms_timer_then_forces_offline() {
        let (mut hub, mut rx0) = hub_with_worker().await;
        hub.mark_online(0, 7, 42).await;
        hub.begin_char_select(50);
        hub.take_timers();

        hub.kick(None).await;
        let pkt = rx0.try_recv().unwrap();
        assert_eq!(&pkt[..2], &[0x06, 0x38]);
        // the account at select had no owner and is cleared immediately
        assert!(hub.online.get(50).is_none());

        let timers = hub.take_timers();
        let token = match timers.as_slice() {
            [(_, TimerEvent::WaitingDisconnect { account_id: 42, token })] => *token,
            other => panic!("unexpected timers {other:?}"),
        };
        // a second kick does not re-arm
        hub.kick(Some(0)).await;
        assert!(hub.take_timers().is_empty());

        hub.on_waiting_disconnect(42, token + 1).await;
        assert!(hub.online.get(42).is_some());
        hub.on_waiting_disconnect(42, token).await;
        assert!(hub.online.get(42).is_none());
        assert_eq!(hub.workers.users(0), 0);
    }

    #[tokio::test]
    async fn test_cleanup_only_after_full_period() {
        let (mut hub, _rx0) = hub_with_worker().await;
        hub.mark_online(0, 7, 42).await;
        hub.reset_worker(0);
        assert_eq!(hub.online.get(42).unwrap().slot, SlotRef::Unknown);

        let period = Duration::from_secs(600);
        hub.cleanup_online(Instant::now(), period).await;
        assert!(hub.online.get(42).is_some());
        hub.cleanup_online(Instant::now() + period, period).await;
        assert!(hub.online.get(42).is_none());
    }

    #[tokio::test]
    async fn test_offline_keeps_record_while_client_connected() {
        let mut hub = running_hub().await;
        hub.begin_char_select(42);
        hub.online.get_mut(42).unwrap().client = Some(5);
        hub.mark_offline(None, 42).await;
        assert!(hub.online.get(42).is_some());
        hub.online.get_mut(42).unwrap().client = None;
        hub.cleanup_online(Instant::now(), Duration::from_secs(600)).await;
        assert!(hub.online.get(42).is_none());
    }
}
