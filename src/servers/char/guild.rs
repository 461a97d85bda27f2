//! Guild aggregate and the `0x301x` map-server requests.
//!
//! Guilds are loaded on first reference and kept in the hub's
//! [`AggregateCache`](super::aggregate::AggregateCache). Every request
//! mutates the resident copy, marks the touched aspects dirty and tells the
//! map servers; the flush cycle writes the aspects later.

use crate::config::TableConfig;

use super::aggregate::{Aggregate, DirtyMask};
use super::charstatus::NAME_LENGTH;
use super::db::{Arg, Statement};
use super::dispatch::PacketBuilder;
use super::hub::Hub;
use super::online::SlotRef;

pub const MAX_GUILD_MEMBERS: usize = 76;
pub const MAX_GUILD_POSITIONS: usize = 20;
pub const MAX_GUILD_ALLIANCES: usize = 16;
pub const MAX_GUILD_EXPULSIONS: usize = 32;
pub const MAX_GUILD_SKILLS: usize = 15;
pub const MAX_GUILD_LEVEL: u16 = 50;
pub const MAX_EMBLEM: usize = 2048;

/// First guild skill id; skills are numbered consecutively from here.
pub const GUILD_SKILL_BASE: u16 = 10000;
/// Guild extension: six more member slots per level.
pub const GD_EXTENSION: u16 = 10004;

pub const MES1_LENGTH: usize = 60;
pub const MES2_LENGTH: usize = 120;
pub const EXPULSION_MES_LENGTH: usize = 40;

// Dirty aspects.
pub const BASIC: DirtyMask = DirtyMask(1 << 0);
pub const LEVEL: DirtyMask = DirtyMask(1 << 1);
pub const CONNECT: DirtyMask = DirtyMask(1 << 2);
pub const MES: DirtyMask = DirtyMask(1 << 3);
pub const EMBLEM: DirtyMask = DirtyMask(1 << 4);
pub const MEMBER: DirtyMask = DirtyMask(1 << 5);
pub const POSITION: DirtyMask = DirtyMask(1 << 6);
pub const ALLIANCE: DirtyMask = DirtyMask(1 << 7);
pub const EXPULSION: DirtyMask = DirtyMask(1 << 8);
pub const SKILL: DirtyMask = DirtyMask(1 << 9);

/// Experience needed to leave guild level `lv`.
pub fn next_exp(lv: u16) -> u64 {
    if lv >= MAX_GUILD_LEVEL {
        return 0;
    }
    let lv = lv as u64;
    2000 * lv * lv + 18_000 * lv
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildMember {
    pub account_id: u32,
    pub char_id: u32,
    pub hair: u16,
    pub hair_color: u16,
    pub gender: u8,
    pub class: u16,
    pub lv: u16,
    pub exp: u64,
    pub online: bool,
    pub position: u8,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildPosition {
    pub name: String,
    pub mode: u32,
    pub exp_mode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildAlliance {
    pub opposition: bool,
    pub guild_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuildExpulsion {
    pub account_id: u32,
    pub char_id: u32,
    pub name: String,
    pub mes: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuildSkill {
    pub id: u16,
    pub lv: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Guild {
    pub guild_id: u32,
    pub name: String,
    pub master: String,
    pub guild_lv: u16,
    pub connect_member: u16,
    pub max_member: u16,
    pub average_lv: u16,
    pub exp: u64,
    pub next_exp: u64,
    pub skill_point: u32,
    pub mes1: String,
    pub mes2: String,
    pub emblem_id: u32,
    pub emblem: Vec<u8>,
    pub members: Vec<GuildMember>,
    pub positions: Vec<GuildPosition>,
    pub alliances: Vec<GuildAlliance>,
    pub expulsions: Vec<GuildExpulsion>,
    pub skills: Vec<GuildSkill>,
}

impl Guild {
    /// Level-1 guild with the default position ladder and every skill at 0.
    pub fn new(guild_id: u32, name: String, master: String) -> Self {
        let positions = (0..MAX_GUILD_POSITIONS)
            .map(|i| GuildPosition {
                name: if i == 0 { "GuildMaster".into() } else { format!("Position {}", i + 1) },
                mode: if i == 0 { 0x11 } else { 0 },
                exp_mode: 0,
            })
            .collect();
        let skills = (0..MAX_GUILD_SKILLS as u16)
            .map(|i| GuildSkill { id: GUILD_SKILL_BASE + i, lv: 0 })
            .collect();
        Self {
            guild_id,
            name,
            master,
            guild_lv: 1,
            max_member: 16,
            next_exp: next_exp(1),
            positions,
            skills,
            ..Default::default()
        }
    }

    pub fn skill_lv(&self, id: u16) -> u8 {
        self.skills.iter().find(|s| s.id == id).map(|s| s.lv).unwrap_or(0)
    }

    pub fn member(&self, char_id: u32) -> Option<&GuildMember> {
        self.members.iter().find(|m| m.char_id == char_id)
    }

    pub fn member_mut(&mut self, char_id: u32) -> Option<&mut GuildMember> {
        self.members.iter_mut().find(|m| m.char_id == char_id)
    }

    /// Applies pending level-ups and recomputes capacity, connect count and
    /// average level. Returns the aspects that changed.
    pub fn calc_info(&mut self) -> DirtyMask {
        let before = (self.guild_lv, self.max_member, self.skill_point, self.next_exp);
        let before_connect = (self.connect_member, self.average_lv);

        if self.guild_lv == 0 {
            self.guild_lv = 1;
        }
        self.next_exp = next_exp(self.guild_lv);
        while self.next_exp > 0 && self.exp >= self.next_exp && self.guild_lv < MAX_GUILD_LEVEL {
            self.exp -= self.next_exp;
            self.guild_lv += 1;
            self.skill_point += 1;
            self.next_exp = next_exp(self.guild_lv);
        }

        let cap = 16 + self.skill_lv(GD_EXTENSION) as usize * 6;
        if cap > MAX_GUILD_MEMBERS {
            tracing::warn!(
                "[char] [guild] guild {} wants {} member slots, capped at {}",
                self.guild_id,
                cap,
                MAX_GUILD_MEMBERS
            );
        }
        self.max_member = cap.min(MAX_GUILD_MEMBERS) as u16;

        let total: u32 = self.members.iter().map(|m| m.lv as u32).sum();
        self.average_lv = if self.members.is_empty() { 0 } else { (total / self.members.len() as u32) as u16 };
        self.connect_member = self.members.iter().filter(|m| m.online).count() as u16;

        let mut changed = DirtyMask::EMPTY;
        if before != (self.guild_lv, self.max_member, self.skill_point, self.next_exp) {
            changed |= LEVEL;
        }
        if before_connect != (self.connect_member, self.average_lv) {
            changed |= CONNECT;
        }
        changed
    }

    /// Appends to the expulsion log, dropping the oldest entry when full.
    pub fn log_expulsion(&mut self, e: GuildExpulsion) {
        if self.expulsions.len() >= MAX_GUILD_EXPULSIONS {
            self.expulsions.remove(0);
        }
        self.expulsions.push(e);
    }
}

fn guild_update(tables: &TableConfig, g: &Guild, group: &'static str, cols: &[&str], values: Vec<Arg>) -> Statement {
    Statement::update(group, &tables.guild, cols, values, "guild_id", g.guild_id)
}

fn replace_guild_rows(group: &'static str, table: &str, guild_id: u32, cols: &[&str], rows: Vec<Vec<Arg>>) -> Vec<Statement> {
    let mut v = vec![Statement::new(group, format!("DELETE FROM `{table}` WHERE `guild_id` = ?")).arg(guild_id)];
    v.extend(Statement::bulk_insert(group, table, cols, rows));
    v
}

impl Aggregate for Guild {
    const KIND: &'static str = "guild";

    fn id(&self) -> u32 {
        self.guild_id
    }

    fn online_members(&self) -> usize {
        self.members.iter().filter(|m| m.online).count()
    }

    fn aspect_statements(&self, tables: &TableConfig, aspect: DirtyMask) -> Vec<Statement> {
        let gid = self.guild_id;
        match aspect {
            BASIC => vec![guild_update(
                tables,
                self,
                "guild_basic",
                &["name", "master"],
                vec![self.name.as_str().into(), self.master.as_str().into()],
            )],
            LEVEL => vec![guild_update(
                tables,
                self,
                "guild_level",
                &["guild_lv", "max_member", "exp", "next_exp", "skill_point"],
                vec![
                    self.guild_lv.into(),
                    self.max_member.into(),
                    self.exp.into(),
                    self.next_exp.into(),
                    self.skill_point.into(),
                ],
            )],
            CONNECT => vec![guild_update(
                tables,
                self,
                "guild_connect",
                &["connect_member", "average_lv"],
                vec![self.connect_member.into(), self.average_lv.into()],
            )],
            MES => vec![guild_update(
                tables,
                self,
                "guild_mes",
                &["mes1", "mes2"],
                vec![self.mes1.as_str().into(), self.mes2.as_str().into()],
            )],
            EMBLEM => vec![guild_update(
                tables,
                self,
                "guild_emblem",
                &["emblem_id", "emblem_data"],
                vec![self.emblem_id.into(), self.emblem.as_slice().into()],
            )],
            MEMBER => replace_guild_rows(
                "guild_member",
                &tables.guild_member,
                gid,
                &[
                    "guild_id", "account_id", "char_id", "hair", "hair_color", "gender", "class", "lv",
                    "exp", "position", "name",
                ],
                self.members
                    .iter()
                    .map(|m| {
                        vec![
                            gid.into(),
                            m.account_id.into(),
                            m.char_id.into(),
                            m.hair.into(),
                            m.hair_color.into(),
                            m.gender.into(),
                            m.class.into(),
                            m.lv.into(),
                            m.exp.into(),
                            m.position.into(),
                            m.name.as_str().into(),
                        ]
                    })
                    .collect(),
            ),
            POSITION => replace_guild_rows(
                "guild_position",
                &tables.guild_position,
                gid,
                &["guild_id", "position", "name", "mode", "exp_mode"],
                self.positions
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        vec![gid.into(), (i as u32).into(), p.name.as_str().into(), p.mode.into(), p.exp_mode.into()]
                    })
                    .collect(),
            ),
            ALLIANCE => replace_guild_rows(
                "guild_alliance",
                &tables.guild_alliance,
                gid,
                &["guild_id", "opposition", "alliance_id", "name"],
                self.alliances
                    .iter()
                    .map(|a| vec![gid.into(), a.opposition.into(), a.guild_id.into(), a.name.as_str().into()])
                    .collect(),
            ),
            EXPULSION => replace_guild_rows(
                "guild_expulsion",
                &tables.guild_expulsion,
                gid,
                &["guild_id", "account_id", "char_id", "name", "mes"],
                self.expulsions
                    .iter()
                    .map(|e| {
                        vec![
                            gid.into(),
                            e.account_id.into(),
                            e.char_id.into(),
                            e.name.as_str().into(),
                            e.mes.as_str().into(),
                        ]
                    })
                    .collect(),
            ),
            SKILL => replace_guild_rows(
                "guild_skill",
                &tables.guild_skill,
                gid,
                &["guild_id", "id", "lv"],
                self.skills
                    .iter()
                    .filter(|s| s.lv > 0)
                    .map(|s| vec![gid.into(), s.id.into(), s.lv.into()])
                    .collect(),
            ),
            other => {
                tracing::warn!("[char] [guild] unknown aspect {:?}", other);
                Vec::new()
            }
        }
    }

    fn delete_statements(&self, tables: &TableConfig) -> Vec<Statement> {
        let gid = self.guild_id;
        let mut v: Vec<Statement> = [
            &tables.guild,
            &tables.guild_member,
            &tables.guild_position,
            &tables.guild_expulsion,
            &tables.guild_skill,
        ]
        .into_iter()
        .map(|t| Statement::new("guild_break", format!("DELETE FROM `{t}` WHERE `guild_id` = ?")).arg(gid))
        .collect();
        v.push(
            Statement::new(
                "guild_break",
                format!(
                    "DELETE FROM `{}` WHERE `guild_id` = ? OR `alliance_id` = ?",
                    tables.guild_alliance
                ),
            )
            .arg(gid)
            .arg(gid),
        );
        v.push(
            Statement::new("guild_break", format!("UPDATE `{}` SET `guild_id` = 0 WHERE `guild_id` = ?", tables.char))
                .arg(gid),
        );
        v
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// `0x3811`
pub fn info_packet(g: &Guild) -> Vec<u8> {
    let mut b = PacketBuilder::variable(0x3811)
        .u32(g.guild_id)
        .u16(g.guild_lv)
        .u16(g.connect_member)
        .u16(g.max_member)
        .u16(g.average_lv)
        .u64(g.exp)
        .u64(g.next_exp)
        .u32(g.skill_point)
        .u32(g.emblem_id)
        .str_fixed(&g.name, NAME_LENGTH)
        .str_fixed(&g.master, NAME_LENGTH)
        .str_fixed(&g.mes1, MES1_LENGTH)
        .str_fixed(&g.mes2, MES2_LENGTH)
        .u16(g.members.len() as u16);
    for m in &g.members {
        b = b
            .u32(m.account_id)
            .u32(m.char_id)
            .u16(m.hair)
            .u16(m.hair_color)
            .u8(m.gender)
            .u16(m.class)
            .u16(m.lv)
            .u64(m.exp)
            .u8(m.online as u8)
            .u8(m.position)
            .str_fixed(&m.name, NAME_LENGTH);
    }
    b = b.u8(g.positions.len() as u8);
    for p in &g.positions {
        b = b.u32(p.mode).u32(p.exp_mode).str_fixed(&p.name, NAME_LENGTH);
    }
    b = b.u8(g.alliances.len() as u8);
    for a in &g.alliances {
        b = b.u8(a.opposition as u8).u32(a.guild_id).str_fixed(&a.name, NAME_LENGTH);
    }
    b = b.u8(g.skills.len() as u8);
    for s in &g.skills {
        b = b.u16(s.id).u8(s.lv);
    }
    b = b.u8(g.expulsions.len() as u8);
    for e in &g.expulsions {
        b = b
            .u32(e.account_id)
            .u32(e.char_id)
            .str_fixed(&e.name, NAME_LENGTH)
            .str_fixed(&e.mes, EXPULSION_MES_LENGTH);
    }
    b.finish()
}

fn member_short_info(guild_id: u32, m: &GuildMember) -> Vec<u8> {
    PacketBuilder::new(0x3815)
        .u32(guild_id)
        .u32(m.account_id)
        .u32(m.char_id)
        .u8(m.online as u8)
        .u16(m.lv)
        .u16(m.class)
        .finish()
}

/// Fields of a `0x3010` create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateGuild {
    pub account_id: u32,
    pub char_id: u32,
    pub lv: u16,
    pub class: u16,
    pub name: String,
    pub master: String,
}

/// A member joining through `0x3012`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMember {
    pub account_id: u32,
    pub char_id: u32,
    pub lv: u16,
    pub class: u16,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

impl Hub {
    /// Makes a guild resident. Freshly loaded guilds pick up which members
    /// are online right now.
    pub async fn ensure_guild(&mut self, guild_id: u32) -> bool {
        if guild_id == 0 {
            return false;
        }
        if self.guilds.contains(guild_id) {
            return true;
        }
        let mut g = match self.store.load_guild(guild_id).await {
            Ok(Some(g)) => g,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!("[char] [guild] load of guild {} failed: {}", guild_id, e);
                return false;
            }
        };
        for m in g.members.iter_mut() {
            m.online = self
                .online
                .get(m.account_id)
                .is_some_and(|r| r.char_id == Some(m.char_id) && matches!(r.slot, SlotRef::Slot(_)));
        }
        g.calc_info();
        let idle = g.online_members() == 0;
        self.guilds.insert(g);
        if idle {
            self.guilds.release(guild_id);
        }
        tracing::debug!("[char] [guild] guild {} loaded", guild_id);
        true
    }

    fn broadcast_guild_info(&mut self, guild_id: u32) {
        if let Some(g) = self.guilds.get(guild_id) {
            let pkt = info_packet(g);
            self.broadcast(&pkt, None);
        }
    }

    /// Folds the aspects `calc_info` reports into the dirty mask; a level
    /// change is announced with a full info packet.
    fn recalc_guild(&mut self, guild_id: u32) {
        let Some(changed) = self.guilds.update(guild_id, Guild::calc_info) else { return };
        self.guilds.mark(guild_id, changed);
        if changed.contains(LEVEL) {
            self.broadcast_guild_info(guild_id);
        }
    }

    /// A member's character came online or went offline.
    pub async fn guild_presence(&mut self, guild_id: u32, account_id: u32, char_id: u32, online: bool) {
        if !self.ensure_guild(guild_id).await {
            return;
        }
        let updated = self.guilds.update(guild_id, |g| {
            let m = g.member_mut(char_id)?;
            if account_id != 0 {
                m.account_id = account_id;
            }
            let changed = m.online != online;
            m.online = online;
            Some((m.clone(), changed))
        });
        let Some(Some((member, changed))) = updated else { return };

        if online {
            self.guilds.touch(guild_id);
        }
        if changed {
            self.recalc_guild(guild_id);
            self.broadcast(&member_short_info(guild_id, &member), None);
        }
        if self.guilds.get(guild_id).is_some_and(|g| g.online_members() == 0) {
            self.guilds.release(guild_id);
        }
    }

    /// `0x3010`
    pub async fn create_guild(&mut self, slot: usize, req: CreateGuild) -> Option<u32> {
        let id = self.try_create_guild(&req).await;
        let pkt = PacketBuilder::new(0x3810).u32(req.account_id).u32(id.unwrap_or(0)).finish();
        self.send_to_slot(slot, pkt);
        if let Some(id) = id {
            tracing::info!("[char] [guild] guild {} ({}) created by char {}", id, req.name, req.char_id);
            self.broadcast_guild_info(id);
        }
        id
    }

    async fn try_create_guild(&mut self, req: &CreateGuild) -> Option<u32> {
        let name = req.name.trim();
        if name.is_empty() || name.len() >= NAME_LENGTH {
            return None;
        }
        let resident_clash = self.guilds.ids().any(|id| self.guilds.get(id).is_some_and(|g| g.name == name));
        if resident_clash {
            return None;
        }
        match self.store.guild_name_taken(name).await {
            Ok(false) => {}
            Ok(true) => return None,
            Err(e) => {
                tracing::warn!("[char] [guild] name check failed: {}", e);
                return None;
            }
        }

        let mut g = Guild::new(0, name.to_owned(), req.master.clone());
        g.members.push(GuildMember {
            account_id: req.account_id,
            char_id: req.char_id,
            class: req.class,
            lv: req.lv,
            online: true,
            position: 0,
            name: req.master.clone(),
            ..Default::default()
        });
        g.calc_info();

        match self.store.create_guild(&g).await {
            Ok(id) => {
                g.guild_id = id;
                self.guilds.insert(g);
                Some(id)
            }
            Err(e) => {
                tracing::warn!("[char] [guild] create of {} failed: {}", name, e);
                None
            }
        }
    }

    /// `0x3011`
    pub async fn guild_info(&mut self, slot: usize, guild_id: u32) {
        let pkt = if self.ensure_guild(guild_id).await {
            self.guilds.get(guild_id).map(info_packet)
        } else {
            None
        };
        let pkt = pkt.unwrap_or_else(|| PacketBuilder::new(0x3812).u32(guild_id).finish());
        self.send_to_slot(slot, pkt);
    }

    /// `0x3012`
    pub async fn guild_add_member(&mut self, slot: usize, guild_id: u32, m: NewMember) -> bool {
        let ok = self.ensure_guild(guild_id).await
            && self
                .guilds
                .modify(guild_id, MEMBER, |g| {
                    if g.members.len() >= g.max_member as usize || g.member(m.char_id).is_some() {
                        return None;
                    }
                    g.members.push(GuildMember {
                        account_id: m.account_id,
                        char_id: m.char_id,
                        class: m.class,
                        lv: m.lv,
                        online: true,
                        position: (MAX_GUILD_POSITIONS - 1) as u8,
                        name: m.name.clone(),
                        ..Default::default()
                    });
                    Some(())
                })
                .is_some();

        let pkt = PacketBuilder::new(0x3813)
            .u32(guild_id)
            .u32(m.account_id)
            .u32(m.char_id)
            .u8(if ok { 0 } else { 1 })
            .finish();
        self.send_to_slot(slot, pkt);
        if ok {
            self.guilds.touch(guild_id);
            self.recalc_guild(guild_id);
            self.broadcast_guild_info(guild_id);
        }
        ok
    }

    /// `0x3013`: a member leaves or is expelled. An emptied guild is broken.
    pub async fn guild_leave(&mut self, guild_id: u32, account_id: u32, char_id: u32, expelled: bool, mes: String) {
        if !self.ensure_guild(guild_id).await {
            return;
        }
        let aspects = if expelled { MEMBER | EXPULSION } else { MEMBER };
        let removed = self.guilds.modify(guild_id, aspects, |g| {
            let idx = g.members.iter().position(|m| m.char_id == char_id)?;
            let m = g.members.remove(idx);
            if expelled {
                g.log_expulsion(GuildExpulsion {
                    account_id: m.account_id,
                    char_id: m.char_id,
                    name: m.name.clone(),
                    mes: mes.clone(),
                });
            }
            Some((m, g.members.is_empty()))
        });
        let Some((member, emptied)) = removed else { return };

        let pkt = PacketBuilder::new(0x3814)
            .u32(guild_id)
            .u32(account_id)
            .u32(char_id)
            .u8(expelled as u8)
            .str_fixed(&member.name, NAME_LENGTH)
            .str_fixed(&mes, EXPULSION_MES_LENGTH)
            .finish();
        self.broadcast(&pkt, None);
        tracing::info!(
            "[char] [guild] char {} {} guild {}",
            char_id,
            if expelled { "expelled from" } else { "left" },
            guild_id
        );

        if emptied {
            self.break_guild(guild_id).await;
        } else {
            self.recalc_guild(guild_id);
        }
    }

    /// `0x3014`
    pub async fn guild_member_info(
        &mut self,
        guild_id: u32,
        account_id: u32,
        char_id: u32,
        online: bool,
        lv: u16,
        class: u16,
    ) {
        if !self.ensure_guild(guild_id).await {
            return;
        }
        let updated = self.guilds.update(guild_id, |g| {
            let m = g.member_mut(char_id)?;
            let level_changed = m.lv != lv || m.class != class;
            m.account_id = account_id;
            m.online = online;
            m.lv = lv;
            m.class = class;
            Some((m.clone(), level_changed))
        });
        let Some(Some((member, level_changed))) = updated else { return };
        if level_changed {
            self.guilds.mark(guild_id, MEMBER);
        }
        if online {
            self.guilds.touch(guild_id);
        }
        self.recalc_guild(guild_id);
        self.broadcast(&member_short_info(guild_id, &member), None);
        if !online && self.guilds.get(guild_id).is_some_and(|g| g.online_members() == 0) {
            self.guilds.release(guild_id);
        }
    }

    /// `0x3015`: deletes the guild from every table in one transaction.
    pub async fn break_guild(&mut self, guild_id: u32) -> bool {
        if !self.ensure_guild(guild_id).await {
            return false;
        }
        let Some(stmts) = self.guilds.get(guild_id).map(|g| g.delete_statements(&self.config.tables)) else {
            return false;
        };
        if let Err(e) = self.store.execute_atomic(&stmts).await {
            tracing::error!("[char] [guild] break of guild {} failed: {}", guild_id, e);
            return false;
        }

        let allies: Vec<u32> = self.guilds.ids().filter(|&id| id != guild_id).collect();
        for other in allies {
            self.guilds.update(other, |g| g.alliances.retain(|a| a.guild_id != guild_id));
        }
        self.guilds.remove(guild_id);
        self.broadcast(&PacketBuilder::new(0x3816).u32(guild_id).finish(), None);
        tracing::info!("[char] [guild] guild {} broken", guild_id);
        true
    }

    /// `0x3016`
    pub async fn guild_notice(&mut self, guild_id: u32, mes1: String, mes2: String) {
        if !self.ensure_guild(guild_id).await {
            return;
        }
        self.guilds.modify(guild_id, MES, |g| {
            if g.mes1 == mes1 && g.mes2 == mes2 {
                return None;
            }
            g.mes1 = mes1.clone();
            g.mes2 = mes2.clone();
            Some(())
        });
        let pkt = PacketBuilder::new(0x3817)
            .u32(guild_id)
            .str_fixed(&mes1, MES1_LENGTH)
            .str_fixed(&mes2, MES2_LENGTH)
            .finish();
        self.broadcast(&pkt, None);
    }

    /// `0x3017`: every accepted emblem bumps the emblem version.
    pub async fn guild_emblem(&mut self, guild_id: u32, data: Vec<u8>) {
        if data.len() > MAX_EMBLEM {
            tracing::warn!("[char] [guild] emblem of {} bytes for guild {} refused", data.len(), guild_id);
            return;
        }
        if !self.ensure_guild(guild_id).await {
            return;
        }
        let Some(version) = self.guilds.modify(guild_id, EMBLEM, |g| {
            g.emblem_id += 1;
            g.emblem = data.clone();
            Some(g.emblem_id)
        }) else {
            return;
        };
        let pkt = PacketBuilder::variable(0x3818).u32(guild_id).u32(version).bytes(&data).finish();
        self.broadcast(&pkt, None);
    }

    /// `0x3018`: spends one skill point if the skill is below `max`.
    pub async fn guild_skill_up(&mut self, guild_id: u32, skill: u16, account_id: u32, max: u16) -> bool {
        if !self.ensure_guild(guild_id).await {
            return false;
        }
        let spent = self.guilds.modify(guild_id, SKILL | LEVEL, |g| {
            if g.skill_point == 0 {
                return None;
            }
            let s = g.skills.iter_mut().find(|s| s.id == skill)?;
            if s.lv as u16 >= max {
                return None;
            }
            s.lv += 1;
            g.skill_point -= 1;
            Some(())
        });
        if spent.is_none() {
            return false;
        }
        self.recalc_guild(guild_id);
        let pkt = PacketBuilder::new(0x3819).u32(guild_id).u16(skill).u32(account_id).finish();
        self.broadcast(&pkt, None);
        self.broadcast_guild_info(guild_id);
        true
    }

    /// `0x3019`. `flag & 1` is an opposition (one-sided), `flag & 8`
    /// removes instead of adding.
    pub async fn guild_alliance(&mut self, guild1: u32, guild2: u32, account1: u32, account2: u32, flag: u8) -> bool {
        if guild1 == guild2 || !self.ensure_guild(guild1).await || !self.ensure_guild(guild2).await {
            return false;
        }
        let opposition = flag & 1 != 0;
        let removal = flag & 8 != 0;
        let name1 = self.guilds.get(guild1).map(|g| g.name.clone()).unwrap_or_default();
        let name2 = self.guilds.get(guild2).map(|g| g.name.clone()).unwrap_or_default();

        let apply = |g: &mut Guild, other: u32, other_name: &str| -> Option<()> {
            if removal {
                let before = g.alliances.len();
                g.alliances.retain(|a| !(a.guild_id == other && a.opposition == opposition));
                return (g.alliances.len() != before).then_some(());
            }
            if g.alliances.iter().any(|a| a.guild_id == other) || g.alliances.len() >= MAX_GUILD_ALLIANCES {
                return None;
            }
            g.alliances.push(GuildAlliance { opposition, guild_id: other, name: other_name.to_owned() });
            Some(())
        };

        if self.guilds.modify(guild1, ALLIANCE, |g| apply(g, guild2, &name2)).is_none() && !removal {
            return false;
        }
        if !opposition {
            self.guilds.modify(guild2, ALLIANCE, |g| apply(g, guild1, &name1));
        }

        let pkt = PacketBuilder::new(0x381A)
            .u32(guild1)
            .u32(guild2)
            .u32(account1)
            .u32(account2)
            .u8(flag)
            .str_fixed(&name1, NAME_LENGTH)
            .str_fixed(&name2, NAME_LENGTH)
            .finish();
        self.broadcast(&pkt, None);
        true
    }

    /// `0x301A`
    pub async fn guild_position(&mut self, guild_id: u32, index: u8, pos: GuildPosition) {
        if index as usize >= MAX_GUILD_POSITIONS || !self.ensure_guild(guild_id).await {
            return;
        }
        let changed = self.guilds.modify(guild_id, POSITION, |g| {
            let p = g.positions.get_mut(index as usize)?;
            if *p == pos {
                return None;
            }
            *p = pos.clone();
            Some(())
        });
        if changed.is_none() {
            return;
        }
        let pkt = PacketBuilder::new(0x381B)
            .u32(guild_id)
            .u8(index)
            .u32(pos.mode)
            .u32(pos.exp_mode)
            .str_fixed(&pos.name, NAME_LENGTH)
            .finish();
        self.broadcast(&pkt, None);
    }

    /// `0x301B`
    pub async fn guild_member_position(&mut self, guild_id: u32, char_id: u32, index: u8) {
        if index as usize >= MAX_GUILD_POSITIONS || !self.ensure_guild(guild_id).await {
            return;
        }
        let found = self
            .guilds
            .modify(guild_id, MEMBER, |g| {
                let m = g.member_mut(char_id).filter(|m| m.position != index)?;
                m.position = index;
                Some(())
            });
        if found.is_some() {
            self.broadcast_guild_info(guild_id);
        }
    }

    /// `0x301C`: the member's contribution counts toward the guild level.
    pub async fn guild_exp(&mut self, guild_id: u32, char_id: u32, exp: u64) {
        if !self.ensure_guild(guild_id).await {
            return;
        }
        let found = self
            .guilds
            .modify(guild_id, MEMBER | LEVEL, |g| {
                let m = g.member_mut(char_id)?;
                if exp == 0 {
                    return None;
                }
                m.exp = m.exp.saturating_add(exp);
                g.exp = g.exp.saturating_add(exp);
                Some(())
            });
        if found.is_some() {
            self.recalc_guild(guild_id);
        }
    }

    /// `0x301D`: the named member becomes master and swaps positions with
    /// the old master.
    pub async fn guild_master_change(&mut self, guild_id: u32, name: String) -> bool {
        if !self.ensure_guild(guild_id).await {
            return false;
        }
        let changed = self
            .guilds
            .modify(guild_id, BASIC | MEMBER, |g| {
                let new_idx = g.members.iter().position(|m| m.name == name)?;
                let old_pos = g.members[new_idx].position;
                for m in g.members.iter_mut().filter(|m| m.position == 0) {
                    m.position = old_pos;
                }
                g.members[new_idx].position = 0;
                let master = g.members.remove(new_idx);
                let ids = (master.account_id, master.char_id);
                g.master = master.name.clone();
                g.members.insert(0, master);
                Some(ids)
            });
        let Some((aid, cid)) = changed else { return false };
        let pkt = PacketBuilder::new(0x381C).u32(guild_id).u32(aid).u32(cid).finish();
        self.broadcast(&pkt, None);
        tracing::info!("[char] [guild] guild {} master is now {}", guild_id, name);
        true
    }

    /// `0x301E`: writes the guild now instead of waiting for the flush cycle.
    pub async fn guild_force_save(&mut self, guild_id: u32) {
        let failed = self.guilds.save(self.store.as_ref(), &self.config.tables, guild_id).await;
        if !failed.is_empty() {
            tracing::warn!("[char] [guild] forced save of guild {} incomplete", guild_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::char::db::MemoryStore;
    use crate::servers::char::hub::tests::hub_on;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn cmd(pkt: &[u8]) -> u16 {
        u16::from_le_bytes([pkt[0], pkt[1]])
    }

    fn drain(rx: &mut Receiver<Vec<u8>>) -> Vec<u16> {
        let mut v = Vec::new();
        while let Ok(p) = rx.try_recv() {
            v.push(cmd(&p));
        }
        v
    }

    fn stored_guild() -> Guild {
        let mut g = Guild::new(5, "Knights".into(), "Arthur".into());
        for (i, (cid, name)) in [(70u32, "Arthur"), (71, "Lance")].into_iter().enumerate() {
            g.members.push(GuildMember {
                account_id: 700 + i as u32,
                char_id: cid,
                lv: 50 + i as u16 * 10,
                position: i as u8,
                name: name.into(),
                ..Default::default()
            });
        }
        g.calc_info();
        g
    }

    async fn guild_hub() -> (Hub, Receiver<Vec<u8>>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_guild(stored_guild());
        let (hub, rx) = hub_on(Arc::clone(&store)).await;
        (hub, rx, store)
    }

    #[test]
    fn test_calc_info_levels_up() {
        let mut g = stored_guild();
        assert_eq!(g.average_lv, 55);
        g.exp = next_exp(1) + 5;
        let changed = g.calc_info();
        assert!(changed.contains(LEVEL));
        assert_eq!((g.guild_lv, g.exp, g.skill_point), (2, 5, 1));
        assert!(g.calc_info().is_empty());
    }

    #[test]
    fn test_extension_raises_capacity() {
        let mut g = stored_guild();
        g.skills.iter_mut().find(|s| s.id == GD_EXTENSION).unwrap().lv = 2;
        g.calc_info();
        assert_eq!(g.max_member, 28);
        g.skills.iter_mut().find(|s| s.id == GD_EXTENSION).unwrap().lv = 100;
        g.calc_info();
        assert_eq!(g.max_member as usize, MAX_GUILD_MEMBERS);
    }

    #[test]
    fn test_expulsion_log_is_bounded() {
        let mut g = stored_guild();
        for i in 0..MAX_GUILD_EXPULSIONS as u32 + 3 {
            g.log_expulsion(GuildExpulsion { char_id: i, ..Default::default() });
        }
        assert_eq!(g.expulsions.len(), MAX_GUILD_EXPULSIONS);
        assert_eq!(g.expulsions[0].char_id, 3);
    }

    #[test]
    fn test_member_aspect_is_delete_then_insert() {
        let g = stored_guild();
        let stmts = g.aspect_statements(&TableConfig::default(), MEMBER);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].sql.starts_with("DELETE FROM `guild_member`"));
        assert_eq!(stmts[1].args.len(), 2 * 11);
    }

    #[tokio::test]
    async fn test_presence_loads_and_releases() {
        let (mut hub, mut rx, _store) = guild_hub().await;
        hub.guild_presence(5, 700, 70, true).await;
        assert_eq!(hub.guilds.get(5).unwrap().connect_member, 1);
        assert!(hub.guilds.dirty(5).contains(CONNECT));
        assert!(!hub.guilds.entry(5).unwrap().pending_removal);
        assert!(drain(&mut rx).contains(&0x3815));

        hub.guild_presence(5, 0, 70, false).await;
        assert!(hub.guilds.entry(5).unwrap().pending_removal);
    }

    #[tokio::test]
    async fn test_create_rejects_taken_name() {
        let (mut hub, mut rx, _store) = guild_hub().await;
        let req = CreateGuild {
            account_id: 1,
            char_id: 2,
            lv: 10,
            class: 1,
            name: "Knights".into(),
            master: "Bob".into(),
        };
        assert_eq!(hub.create_guild(0, req.clone()).await, None);
        assert_eq!(rx.try_recv().unwrap(), vec![0x10, 0x38, 1, 0, 0, 0, 0, 0, 0, 0]);

        let id = hub.create_guild(0, CreateGuild { name: "Rounders".into(), ..req }).await.unwrap();
        let g = hub.guilds.get(id).unwrap();
        assert_eq!(g.members.len(), 1);
        assert_eq!(g.members[0].position, 0);
        assert!(hub.guilds.dirty(id).is_empty());
    }

    #[tokio::test]
    async fn test_leave_expels_and_last_member_breaks() {
        let (mut hub, mut rx, store) = guild_hub().await;
        hub.guild_leave(5, 701, 71, true, "bye".into()).await;
        let g = hub.guilds.get(5).unwrap();
        assert_eq!(g.members.len(), 1);
        assert_eq!(g.expulsions.len(), 1);
        assert!(hub.guilds.dirty(5).contains(MEMBER | EXPULSION));
        assert!(drain(&mut rx).contains(&0x3814));

        hub.guild_leave(5, 700, 70, false, String::new()).await;
        assert!(!hub.guilds.contains(5));
        assert!(drain(&mut rx).contains(&0x3816));
        let breaks = store.statements().iter().filter(|s| s.group == "guild_break").count();
        assert_eq!(breaks, 7);
    }

    #[tokio::test]
    async fn test_failed_break_keeps_guild() {
        let (mut hub, _rx, store) = guild_hub().await;
        store.fail_matching("guild_break");
        assert!(!hub.break_guild(5).await);
        assert!(hub.guilds.contains(5));
    }

    #[tokio::test]
    async fn test_skill_up_needs_points() {
        let (mut hub, _rx, _store) = guild_hub().await;
        assert!(!hub.guild_skill_up(5, GD_EXTENSION, 700, 10).await);
        hub.guilds.update(5, |g| g.skill_point = 1);
        assert!(hub.guild_skill_up(5, GD_EXTENSION, 700, 10).await);
        let g = hub.guilds.get(5).unwrap();
        assert_eq!((g.skill_point, g.skill_lv(GD_EXTENSION), g.max_member), (0, 1, 22));
        assert!(hub.guilds.dirty(5).contains(SKILL));
    }

    #[tokio::test]
    async fn test_alliance_both_sides_opposition_one_side() {
        let (mut hub, _rx, store) = guild_hub().await;
        store.insert_guild(Guild::new(6, "Saxons".into(), "Cerdic".into()));
        assert!(hub.guild_alliance(5, 6, 700, 800, 0).await);
        assert_eq!(hub.guilds.get(6).unwrap().alliances[0].guild_id, 5);
        assert_eq!(hub.guilds.get(5).unwrap().alliances[0].name, "Saxons");
        // already allied
        assert!(!hub.guild_alliance(5, 6, 700, 800, 1).await);
        assert!(hub.guild_alliance(5, 6, 700, 800, 8).await);
        assert!(hub.guilds.get(6).unwrap().alliances.is_empty());

        assert!(hub.guild_alliance(5, 6, 700, 800, 1).await);
        assert!(hub.guilds.get(5).unwrap().alliances[0].opposition);
        assert!(hub.guilds.get(6).unwrap().alliances.is_empty());

        let tables = TableConfig::default();
        hub.guilds.save(store.as_ref(), &tables, 5).await;
        assert!(!hub.guild_alliance(5, 6, 700, 800, 1).await);
        assert!(hub.guilds.dirty(5).is_empty());
    }

    #[tokio::test]
    async fn test_refused_requests_leave_guild_clean() {
        let (mut hub, _rx, store) = guild_hub().await;
        assert!(hub.ensure_guild(5).await);
        let dup = NewMember { account_id: 700, char_id: 70, lv: 50, class: 1, name: "Arthur".into() };
        assert!(!hub.guild_add_member(0, 5, dup).await);
        hub.guild_leave(5, 999, 99, false, String::new()).await;
        hub.guild_member_position(5, 99, 3).await;
        hub.guild_exp(5, 99, 1000).await;
        assert!(!hub.guild_master_change(5, "Nobody".into()).await);
        let same = hub.guilds.get(5).unwrap().positions[2].clone();
        hub.guild_position(5, 2, same).await;
        assert!(hub.guilds.dirty(5).is_empty());

        store.take_statements();
        hub.guilds.flush_step(store.as_ref(), &TableConfig::default(), Duration::from_secs(60)).await;
        assert!(store.take_statements().is_empty());
    }

    #[tokio::test]
    async fn test_master_change_swaps_positions() {
        let (mut hub, mut rx, _store) = guild_hub().await;
        assert!(hub.guild_master_change(5, "Lance".into()).await);
        let g = hub.guilds.get(5).unwrap();
        assert_eq!(g.master, "Lance");
        assert_eq!((g.members[0].name.as_str(), g.members[0].position), ("Lance", 0));
        assert_eq!(g.member(70).unwrap().position, 1);
        assert!(drain(&mut rx).contains(&0x381C));
        assert!(!hub.guild_master_change(5, "Nobody".into()).await);
    }

    #[tokio::test]
    async fn test_emblem_bumps_version() {
        let (mut hub, mut rx, _store) = guild_hub().await;
        hub.guild_emblem(5, vec![1, 2, 3]).await;
        hub.guild_emblem(5, vec![0; MAX_EMBLEM + 1]).await;
        assert_eq!(hub.guilds.get(5).unwrap().emblem_id, 1);
        assert_eq!(drain(&mut rx), vec![0x3818]);
    }

    #[tokio::test]
    async fn test_info_for_missing_guild() {
        let (mut hub, mut rx, _store) = guild_hub().await;
        hub.guild_info(0, 99).await;
        assert_eq!(rx.try_recv().unwrap(), vec![0x12, 0x38, 99, 0, 0, 0]);
        hub.guild_info(0, 5).await;
        assert_eq!(cmd(&rx.try_recv().unwrap()), 0x3811);
    }
}
