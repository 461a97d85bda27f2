//! Map-server slots.
//!
//! The slot table has a fixed capacity (`max_map_servers`). A slot is bound
//! to one connection at a time and is reset, never removed, when that
//! connection goes away, so slot indices stay stable for the online registry.

use tokio::sync::mpsc::{self, error::TrySendError};

use super::dispatch::PacketBuilder;
use super::hub::Hub;
use super::online::SlotRef;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    #[error("bad credentials")]
    BadCredentials,

    #[error("hub is not accepting map servers")]
    NotRunning,

    #[error("no free map server slot")]
    NoFreeSlot,
}

impl RegisterError {
    /// Result byte of the `0x3800` reply.
    pub fn code(self) -> u8 {
        match self {
            RegisterError::BadCredentials => 1,
            RegisterError::NotRunning => 2,
            RegisterError::NoFreeSlot => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Unbound,
    /// The connection is gone; the slot should be reset.
    Closed,
}

#[derive(Debug)]
struct Conn {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct WorkerSlot {
    conn: Option<Conn>,
    pub ip: u32,
    pub port: u16,
    pub users: u32,
    pub zones: Vec<u16>,
}

#[derive(Debug)]
pub struct WorkerRegistry {
    slots: Vec<WorkerSlot>,
}

impl WorkerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { slots: (0..capacity).map(|_| WorkerSlot::default()).collect() }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, slot: usize) -> Option<&WorkerSlot> {
        self.slots.get(slot)
    }

    pub fn is_bound(&self, slot: usize) -> bool {
        self.slots.get(slot).is_some_and(|s| s.conn.is_some())
    }

    pub fn conn_id(&self, slot: usize) -> Option<u64> {
        self.slots.get(slot)?.conn.as_ref().map(|c| c.id)
    }

    /// Bound and its connection task still reading the queue.
    pub fn is_alive(&self, slot: usize) -> bool {
        self.slots
            .get(slot)
            .and_then(|s| s.conn.as_ref())
            .is_some_and(|c| !c.tx.is_closed())
    }

    /// Binds the first free slot.
    pub fn bind(&mut self, conn_id: u64, tx: mpsc::Sender<Vec<u8>>, ip: u32, port: u16) -> Option<usize> {
        let idx = self.slots.iter().position(|s| s.conn.is_none())?;
        self.slots[idx] = WorkerSlot { conn: Some(Conn { id: conn_id, tx }), ip, port, users: 0, zones: Vec::new() };
        Some(idx)
    }

    /// Returns the slot to the free pool.
    pub fn clear(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = WorkerSlot::default();
        }
    }

    pub fn bound(&self) -> Vec<usize> {
        (0..self.slots.len()).filter(|&i| self.is_bound(i)).collect()
    }

    pub fn set_zones(&mut self, slot: usize, zones: Vec<u16>) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.zones = zones;
        }
    }

    pub fn zones(&self, slot: usize) -> &[u16] {
        self.slots.get(slot).map(|s| s.zones.as_slice()).unwrap_or(&[])
    }

    pub fn addr(&self, slot: usize) -> Option<(u32, u16)> {
        self.slots.get(slot).filter(|s| s.conn.is_some()).map(|s| (s.ip, s.port))
    }

    /// First bound slot serving `zone`. `None` is normal while map servers
    /// are still starting.
    pub fn find_owner(&self, zone: u16) -> Option<usize> {
        self.slots.iter().position(|s| s.conn.is_some() && s.zones.contains(&zone))
    }

    pub fn find_by_addr(&self, ip: u32, port: u16) -> Option<usize> {
        self.slots.iter().position(|s| s.conn.is_some() && s.ip == ip && s.port == port)
    }

    pub fn users(&self, slot: usize) -> u32 {
        self.slots.get(slot).map(|s| s.users).unwrap_or(0)
    }

    pub fn total_users(&self) -> u32 {
        self.slots.iter().map(|s| s.users).sum()
    }

    pub(super) fn add_user(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.users += 1;
        }
    }

    pub(super) fn remove_user(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.users = s.users.saturating_sub(1);
        }
    }

    pub fn send(&self, slot: usize, pkt: Vec<u8>) -> SendStatus {
        let Some(conn) = self.slots.get(slot).and_then(|s| s.conn.as_ref()) else {
            return SendStatus::Unbound;
        };
        match conn.tx.try_send(pkt) {
            Ok(()) => SendStatus::Sent,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("[char] [mapif] map server #{} send queue full, packet dropped", slot);
                SendStatus::Sent
            }
            Err(TrySendError::Closed(_)) => SendStatus::Closed,
        }
    }
}

fn zone_list(cmd: u16, ip: u32, port: u16, zones: &[u16]) -> Vec<u8> {
    let mut b = PacketBuilder::variable(cmd).u32(ip).u16(port).u16(zones.len() as u16);
    for &z in zones {
        b = b.u16(z);
    }
    b.finish()
}

/// `0x3801`: `zones` are now served by the map server at ip:port.
pub fn zones_added(ip: u32, port: u16, zones: &[u16]) -> Vec<u8> {
    zone_list(0x3801, ip, port, zones)
}

/// `0x3802`: the map server at ip:port no longer serves `zones`.
pub fn zones_removed(ip: u32, port: u16, zones: &[u16]) -> Vec<u8> {
    zone_list(0x3802, ip, port, zones)
}

impl Hub {
    pub fn register(
        &mut self,
        conn_id: u64,
        tx: mpsc::Sender<Vec<u8>>,
        id: &str,
        pw: &str,
        ip: u32,
        port: u16,
    ) -> Result<usize, RegisterError> {
        if id != self.config.char_id || pw != self.config.char_pw {
            return Err(RegisterError::BadCredentials);
        }
        if !self.is_running() {
            return Err(RegisterError::NotRunning);
        }
        let slot = self.workers.bind(conn_id, tx, ip, port).ok_or(RegisterError::NoFreeSlot)?;
        tracing::info!("[char] [mapif] map server #{} connected from {}:{}", slot, ip_str(ip), port);
        Ok(slot)
    }

    /// Records the zones a slot serves and exchanges zone lists with every
    /// other bound slot.
    pub fn publish_zones(&mut self, slot: usize, zones: Vec<u16>) {
        let Some((ip, port)) = self.workers.addr(slot) else { return };
        tracing::info!("[char] [mapif] map server #{} serves {} zones", slot, zones.len());
        let announce = zones_added(ip, port, &zones);
        let announce_empty = zones.is_empty();
        self.workers.set_zones(slot, zones);

        for other in self.workers.bound() {
            if other == slot {
                continue;
            }
            if !announce_empty {
                self.send_to_slot(other, announce.clone());
            }
            // the peer may have been reset by the send above
            let Some((oip, oport)) = self.workers.addr(other) else { continue };
            let theirs = self.workers.zones(other);
            if !theirs.is_empty() {
                let pkt = zones_added(oip, oport, theirs);
                self.send_to_slot(slot, pkt);
            }
        }
    }

    pub fn find_owner(&self, zone: u16) -> Option<usize> {
        self.workers.find_owner(zone)
    }

    /// Sends to one slot. A closed connection resets the slot on the spot.
    pub fn send_to_slot(&mut self, slot: usize, pkt: Vec<u8>) -> bool {
        match self.workers.send(slot, pkt) {
            SendStatus::Sent => true,
            SendStatus::Unbound => false,
            SendStatus::Closed => {
                tracing::warn!("[char] [mapif] map server #{} connection is gone, resetting", slot);
                self.reset_worker(slot);
                false
            }
        }
    }

    /// Sends to every bound slot except `except`; returns how many got it.
    pub fn broadcast(&mut self, pkt: &[u8], except: Option<usize>) -> usize {
        let mut sent = 0;
        for slot in self.workers.bound() {
            if Some(slot) != except && self.send_to_slot(slot, pkt.to_vec()) {
                sent += 1;
            }
        }
        sent
    }

    /// Returns a slot to the free pool. Its characters become "unknown"
    /// (they may already be on another map server) and its peers are told
    /// the zones are gone.
    pub fn reset_worker(&mut self, slot: usize) {
        if !self.workers.is_bound(slot) {
            return;
        }
        let (ip, port) = self.workers.addr(slot).unwrap_or_default();
        let zones = self.workers.zones(slot).to_vec();

        let moved = self.online.detach_slot(&mut self.workers, slot);
        self.workers.clear(slot);
        tracing::info!(
            "[char] [mapif] map server #{} reset, {} characters now unknown",
            slot,
            moved
        );

        if !zones.is_empty() {
            self.broadcast(&zones_removed(ip, port, &zones), Some(slot));
        }
        self.send_user_count();
    }

    /// Reset only if `conn_id` still owns the slot.
    pub fn worker_disconnected(&mut self, slot: usize, conn_id: u64) {
        if self.workers.conn_id(slot) == Some(conn_id) {
            tracing::info!("[char] [mapif] map server #{} disconnected", slot);
            self.reset_worker(slot);
        }
    }

    /// Number of online records pointing at `slot`.
    pub fn slot_population(&self, slot: usize) -> usize {
        self.online.iter().filter(|r| r.slot == SlotRef::Slot(slot)).count()
    }
}

pub fn ip_str(ip: u32) -> String {
    std::net::Ipv4Addr::from(ip.to_be_bytes()).to_string()
}
