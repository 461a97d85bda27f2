//! Party aggregate and the `0x302x` map-server requests.
//!
//! Parties share the guild cache machinery: resident while a member is
//! online, dirty per aspect, written by the flush cycle.

use crate::config::TableConfig;

use super::aggregate::{Aggregate, DirtyMask};
use super::charstatus::NAME_LENGTH;
use super::db::Statement;
use super::dispatch::PacketBuilder;
use super::hub::Hub;
use super::online::SlotRef;

pub const MAX_PARTY: usize = 12;

// Dirty aspects.
pub const BASIC: DirtyMask = DirtyMask(1 << 0);
pub const MEMBER: DirtyMask = DirtyMask(1 << 1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartyMember {
    pub account_id: u32,
    pub char_id: u32,
    pub name: String,
    pub class: u16,
    pub lv: u16,
    pub zone: u16,
    pub leader: bool,
    pub online: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Party {
    pub party_id: u32,
    pub name: String,
    pub exp_share: u8,
    pub item_share: u8,
    pub members: Vec<PartyMember>,
    /// Level range of the online members, from [`Party::calc_share_window`].
    pub min_lv: u16,
    pub max_lv: u16,
    pub online_count: usize,
}

impl Party {
    pub fn new(party_id: u32, name: String) -> Self {
        Self { party_id, name, ..Default::default() }
    }

    pub fn member(&self, char_id: u32) -> Option<&PartyMember> {
        self.members.iter().find(|m| m.char_id == char_id)
    }

    pub fn member_mut(&mut self, char_id: u32) -> Option<&mut PartyMember> {
        self.members.iter_mut().find(|m| m.char_id == char_id)
    }

    pub fn calc_share_window(&mut self) {
        let online = self.members.iter().filter(|m| m.online);
        self.online_count = online.clone().count();
        self.min_lv = online.clone().map(|m| m.lv).min().unwrap_or(0);
        self.max_lv = online.map(|m| m.lv).max().unwrap_or(0);
    }

    /// Even share needs every online member within `spread` levels.
    pub fn can_share_exp(&self, spread: u32) -> bool {
        self.online_count < 2 || u32::from(self.max_lv - self.min_lv) <= spread
    }
}

impl Aggregate for Party {
    const KIND: &'static str = "party";

    fn id(&self) -> u32 {
        self.party_id
    }

    fn online_members(&self) -> usize {
        self.members.iter().filter(|m| m.online).count()
    }

    fn aspect_statements(&self, tables: &TableConfig, aspect: DirtyMask) -> Vec<Statement> {
        let pid = self.party_id;
        match aspect {
            BASIC => vec![Statement::update(
                "party_basic",
                &tables.party,
                &["name", "exp", "item"],
                vec![self.name.as_str().into(), self.exp_share.into(), self.item_share.into()],
                "party_id",
                pid,
            )],
            MEMBER => {
                let mut v = vec![Statement::new(
                    "party_member",
                    format!("DELETE FROM `{}` WHERE `party_id` = ?", tables.party_member),
                )
                .arg(pid)];
                v.extend(Statement::bulk_insert(
                    "party_member",
                    &tables.party_member,
                    &["party_id", "account_id", "char_id", "name", "class", "lv", "leader"],
                    self.members
                        .iter()
                        .map(|m| {
                            vec![
                                pid.into(),
                                m.account_id.into(),
                                m.char_id.into(),
                                m.name.as_str().into(),
                                m.class.into(),
                                m.lv.into(),
                                m.leader.into(),
                            ]
                        })
                        .collect(),
                ));
                v
            }
            other => {
                tracing::warn!("[char] [party] unknown aspect {:?}", other);
                Vec::new()
            }
        }
    }

    fn delete_statements(&self, tables: &TableConfig) -> Vec<Statement> {
        let pid = self.party_id;
        vec![
            Statement::new("party_break", format!("DELETE FROM `{}` WHERE `party_id` = ?", tables.party)).arg(pid),
            Statement::new("party_break", format!("DELETE FROM `{}` WHERE `party_id` = ?", tables.party_member))
                .arg(pid),
            Statement::new(
                "party_break",
                format!("UPDATE `{}` SET `party_id` = 0 WHERE `party_id` = ?", tables.char),
            )
            .arg(pid),
        ]
    }
}

/// `0x3821`
pub fn info_packet(p: &Party) -> Vec<u8> {
    let mut b = PacketBuilder::variable(0x3821)
        .u32(p.party_id)
        .u8(p.exp_share)
        .u8(p.item_share)
        .str_fixed(&p.name, NAME_LENGTH)
        .u8(p.members.len() as u8);
    for m in &p.members {
        b = b
            .u32(m.account_id)
            .u32(m.char_id)
            .str_fixed(&m.name, NAME_LENGTH)
            .u16(m.class)
            .u16(m.lv)
            .u16(m.zone)
            .u8(m.leader as u8)
            .u8(m.online as u8);
    }
    b.finish()
}

fn option_changed(party_id: u32, account_id: u32, exp: u8, item: u8, refused: bool) -> Vec<u8> {
    PacketBuilder::new(0x3827)
        .u32(party_id)
        .u32(account_id)
        .u8(exp)
        .u8(item)
        .u8(refused as u8)
        .finish()
}

fn member_moved(party_id: u32, m: &PartyMember) -> Vec<u8> {
    PacketBuilder::new(0x3825)
        .u32(party_id)
        .u32(m.account_id)
        .u32(m.char_id)
        .u8(m.online as u8)
        .u16(m.lv)
        .u16(m.zone)
        .finish()
}

/// Fields of a `0x3020` create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParty {
    pub account_id: u32,
    pub char_id: u32,
    pub lv: u16,
    pub class: u16,
    pub exp_share: u8,
    pub item_share: u8,
    pub name: String,
    pub leader_name: String,
}

impl Hub {
    /// Makes a party resident, taking online flags from the online registry.
    pub async fn ensure_party(&mut self, party_id: u32) -> bool {
        if party_id == 0 {
            return false;
        }
        if self.parties.contains(party_id) {
            return true;
        }
        let mut p = match self.store.load_party(party_id).await {
            Ok(Some(p)) => p,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!("[char] [party] load of party {} failed: {}", party_id, e);
                return false;
            }
        };
        for m in p.members.iter_mut() {
            m.online = self
                .online
                .get(m.account_id)
                .is_some_and(|r| r.char_id == Some(m.char_id) && matches!(r.slot, SlotRef::Slot(_)));
        }
        p.calc_share_window();
        let idle = p.online_members() == 0;
        self.parties.insert(p);
        if idle {
            self.parties.release(party_id);
        }
        true
    }

    fn broadcast_party_info(&mut self, party_id: u32) {
        if let Some(p) = self.parties.get(party_id) {
            let pkt = info_packet(p);
            self.broadcast(&pkt, None);
        }
    }

    /// Recomputes the level window and drops even share once it is too wide.
    fn check_share_window(&mut self, party_id: u32) {
        let spread = self.config.party_share_level;
        let turned_off = self.parties.update(party_id, |p| {
            p.calc_share_window();
            if p.exp_share != 0 && !p.can_share_exp(spread) {
                p.exp_share = 0;
                return Some(p.item_share);
            }
            None
        });
        if let Some(Some(item)) = turned_off {
            self.parties.mark(party_id, BASIC);
            tracing::debug!("[char] [party] party {} level spread too wide, even share off", party_id);
            self.broadcast(&option_changed(party_id, 0, 0, item, true), None);
        }
    }

    fn release_idle_party(&mut self, party_id: u32) {
        if self.parties.get(party_id).is_some_and(|p| p.online_members() == 0) {
            self.parties.release(party_id);
        }
    }

    /// A member's character came online or went offline.
    pub async fn party_presence(&mut self, party_id: u32, account_id: u32, char_id: u32, online: bool) {
        if !self.ensure_party(party_id).await {
            return;
        }
        let updated = self
            .parties
            .update(party_id, |p| {
                let m = p.member_mut(char_id)?;
                if account_id != 0 {
                    m.account_id = account_id;
                }
                let changed = m.online != online;
                m.online = online;
                Some((m.clone(), changed))
            })
            .flatten();
        let Some((member, changed)) = updated else { return };
        if online {
            self.parties.touch(party_id);
        }
        if changed {
            self.check_share_window(party_id);
            self.broadcast(&member_moved(party_id, &member), None);
        }
        self.release_idle_party(party_id);
    }

    /// `0x3020`
    pub async fn create_party(&mut self, slot: usize, req: CreateParty) -> Option<u32> {
        let id = self.try_create_party(&req).await;
        let pkt = PacketBuilder::new(0x3820)
            .u32(req.account_id)
            .u32(req.char_id)
            .u32(id.unwrap_or(0))
            .finish();
        self.send_to_slot(slot, pkt);
        if let Some(id) = id {
            tracing::info!("[char] [party] party {} ({}) created by char {}", id, req.name, req.char_id);
            self.broadcast_party_info(id);
        }
        id
    }

    async fn try_create_party(&mut self, req: &CreateParty) -> Option<u32> {
        let name = req.name.trim();
        if name.is_empty() || name.len() >= NAME_LENGTH {
            return None;
        }
        if self.parties.ids().any(|id| self.parties.get(id).is_some_and(|p| p.name == name)) {
            return None;
        }

        let mut p = Party::new(0, name.to_owned());
        p.exp_share = req.exp_share;
        p.item_share = req.item_share;
        p.members.push(PartyMember {
            account_id: req.account_id,
            char_id: req.char_id,
            name: req.leader_name.clone(),
            class: req.class,
            lv: req.lv,
            leader: true,
            online: true,
            ..Default::default()
        });
        p.calc_share_window();

        match self.store.create_party(&p).await {
            Ok(id) => {
                p.party_id = id;
                self.parties.insert(p);
                Some(id)
            }
            Err(e) => {
                tracing::warn!("[char] [party] create of {} failed: {}", name, e);
                None
            }
        }
    }

    /// `0x3021`
    pub async fn party_info(&mut self, slot: usize, party_id: u32, char_id: u32) {
        let pkt = if self.ensure_party(party_id).await { self.parties.get(party_id).map(info_packet) } else { None };
        let pkt = pkt.unwrap_or_else(|| PacketBuilder::new(0x3822).u32(party_id).u32(char_id).finish());
        self.send_to_slot(slot, pkt);
    }

    /// `0x3022`
    pub async fn party_add_member(&mut self, slot: usize, party_id: u32, m: PartyMember) -> bool {
        let (aid, cid) = (m.account_id, m.char_id);
        let ok = self.ensure_party(party_id).await
            && self
                .parties
                .modify(party_id, MEMBER, |p| {
                    if p.members.len() >= MAX_PARTY || p.member(m.char_id).is_some() {
                        return None;
                    }
                    p.members.push(PartyMember { online: true, leader: false, ..m });
                    Some(())
                })
                .is_some();

        let pkt = PacketBuilder::new(0x3823).u32(party_id).u32(aid).u32(cid).u8(if ok { 0 } else { 1 }).finish();
        self.send_to_slot(slot, pkt);
        if ok {
            self.parties.touch(party_id);
            self.check_share_window(party_id);
            self.broadcast_party_info(party_id);
        }
        ok
    }

    /// `0x3023`: a leaving leader breaks the party.
    pub async fn party_leave(&mut self, party_id: u32, account_id: u32, char_id: u32) {
        if !self.ensure_party(party_id).await {
            return;
        }
        let removed = self.parties.modify(party_id, MEMBER, |p| {
            let idx = p.members.iter().position(|m| m.char_id == char_id)?;
            let m = p.members.remove(idx);
            Some(m.leader || p.members.is_empty())
        });
        let Some(breaks) = removed else { return };

        let pkt = PacketBuilder::new(0x3824).u32(party_id).u32(account_id).u32(char_id).finish();
        self.broadcast(&pkt, None);
        tracing::debug!("[char] [party] char {} left party {}", char_id, party_id);

        if breaks {
            self.break_party(party_id).await;
        } else {
            self.check_share_window(party_id);
            self.release_idle_party(party_id);
        }
    }

    /// `0x3024`: online state, level or zone of a member changed.
    pub async fn party_member_moved(
        &mut self,
        party_id: u32,
        account_id: u32,
        char_id: u32,
        online: bool,
        lv: u16,
        zone: u16,
    ) {
        if !self.ensure_party(party_id).await {
            return;
        }
        let updated = self
            .parties
            .update(party_id, |p| {
                let m = p.member_mut(char_id)?;
                let level_changed = m.lv != lv;
                m.account_id = account_id;
                m.online = online;
                m.lv = lv;
                m.zone = zone;
                Some((m.clone(), level_changed))
            })
            .flatten();
        let Some((member, level_changed)) = updated else { return };
        if level_changed {
            self.parties.mark(party_id, MEMBER);
        }
        if online {
            self.parties.touch(party_id);
        }
        self.check_share_window(party_id);
        self.broadcast(&member_moved(party_id, &member), None);
        self.release_idle_party(party_id);
    }

    /// `0x3025`: even share is refused while the level window is too wide.
    pub async fn party_change_option(&mut self, party_id: u32, account_id: u32, exp: u8, item: u8) {
        if !self.ensure_party(party_id).await {
            return;
        }
        let spread = self.config.party_share_level;
        let Some((exp, refused, changed)) = self.parties.update(party_id, |p| {
            p.calc_share_window();
            let refused = exp != 0 && !p.can_share_exp(spread);
            let exp = if refused { 0 } else { exp };
            let changed = p.exp_share != exp || p.item_share != item;
            p.exp_share = exp;
            p.item_share = item;
            (exp, refused, changed)
        }) else {
            return;
        };
        if changed {
            self.parties.mark(party_id, BASIC);
        }
        self.broadcast(&option_changed(party_id, account_id, exp, item, refused), None);
    }

    /// `0x3026`
    pub async fn break_party(&mut self, party_id: u32) -> bool {
        if !self.ensure_party(party_id).await {
            return false;
        }
        let Some(stmts) = self.parties.get(party_id).map(|p| p.delete_statements(&self.config.tables)) else {
            return false;
        };
        if let Err(e) = self.store.execute_atomic(&stmts).await {
            tracing::error!("[char] [party] break of party {} failed: {}", party_id, e);
            return false;
        }
        self.parties.remove(party_id);
        self.broadcast(&PacketBuilder::new(0x3826).u32(party_id).finish(), None);
        tracing::info!("[char] [party] party {} broken", party_id);
        true
    }
}
