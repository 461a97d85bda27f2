//! Relational store access.
//!
//! Everything the hub writes goes through [`Store`]. The persistence differ
//! and the aggregate cache produce [`Statement`]s; the store runs them one at
//! a time or, for a handful of multi-table changes, inside one transaction.
//! [`MySqlStore`] is the production backend; [`MemoryStore`] keeps rows in
//! memory and records every statement it is given.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::query::Query;
use sqlx::{MySql, MySqlPool, Row};

use crate::config::TableConfig;

use super::aggregate::Aggregate;
use super::charstatus::{CharRecord, CharSummary, Friend, Hotkey, Point, Skill};
use super::guild::{self, Guild, GuildAlliance, GuildExpulsion, GuildMember, GuildPosition, GuildSkill};
use super::party::{self, Party, PartyMember};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("statement rejected: {0}")]
    Rejected(String),
}

/// One bound parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    U64(u64),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
}

macro_rules! arg_from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for Arg {
            fn from(v: $t) -> Self {
                Arg::U64(v as u64)
            }
        }
    )*};
}
arg_from_unsigned!(u8, u16, u32, u64);

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::I64(v as i64)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::U64(v as u64)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_owned())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

impl From<&[u8]> for Arg {
    fn from(v: &[u8]) -> Self {
        Arg::Bytes(v.to_vec())
    }
}

/// A parameterized statement. `group` names the field group or dirty aspect
/// it persists and is only used for logging and failure injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub group: &'static str,
    pub sql: String,
    pub args: Vec<Arg>,
}

impl Statement {
    pub fn new(group: &'static str, sql: impl Into<String>) -> Self {
        Self { group, sql: sql.into(), args: Vec::new() }
    }

    pub fn arg(mut self, a: impl Into<Arg>) -> Self {
        self.args.push(a.into());
        self
    }

    /// `INSERT INTO table (cols) VALUES (..),(..)`; `None` when there are no rows.
    pub fn bulk_insert(
        group: &'static str,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<Arg>>,
    ) -> Option<Self> {
        if rows.is_empty() {
            return None;
        }
        let cols = columns.iter().map(|c| format!("`{c}`")).collect::<Vec<_>>().join(", ");
        let one = format!("({})", vec!["?"; columns.len()].join(", "));
        let values = vec![one; rows.len()].join(", ");
        Some(Self {
            group,
            sql: format!("INSERT INTO `{table}` ({cols}) VALUES {values}"),
            args: rows.into_iter().flatten().collect(),
        })
    }

    /// `UPDATE table SET a = ?, b = ? WHERE key = ?` with `values` followed by `key_value`.
    pub fn update(
        group: &'static str,
        table: &str,
        columns: &[&str],
        values: Vec<Arg>,
        key: &str,
        key_value: impl Into<Arg>,
    ) -> Self {
        let set = columns.iter().map(|c| format!("`{c}` = ?")).collect::<Vec<_>>().join(", ");
        let mut args = values;
        args.push(key_value.into());
        Self { group, sql: format!("UPDATE `{table}` SET {set} WHERE `{key}` = ?"), args }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Runs one statement, returning the number of affected rows.
    async fn execute(&self, stmt: &Statement) -> Result<u64, StoreError>;

    /// Runs `stmts` in one transaction; nothing is applied on failure.
    async fn execute_atomic(&self, stmts: &[Statement]) -> Result<(), StoreError>;

    async fn load_char(&self, char_id: u32) -> Result<Option<CharRecord>, StoreError>;

    async fn load_char_list(&self, account_id: u32) -> Result<Vec<CharSummary>, StoreError>;

    /// `(party_id, guild_id)` of a character.
    async fn load_affiliation(&self, char_id: u32) -> Result<Option<(u32, u32)>, StoreError>;

    async fn load_guild(&self, guild_id: u32) -> Result<Option<Guild>, StoreError>;

    async fn load_party(&self, party_id: u32) -> Result<Option<Party>, StoreError>;

    async fn guild_name_taken(&self, name: &str) -> Result<bool, StoreError>;

    /// Inserts a new guild with its members, positions and skills; returns the new id.
    async fn create_guild(&self, guild: &Guild) -> Result<u32, StoreError>;

    /// Inserts a new party with its members; returns the new id.
    async fn create_party(&self, party: &Party) -> Result<u32, StoreError>;

    /// `char_id = None` applies to every character of the account.
    async fn set_online_flag(
        &self,
        account_id: u32,
        char_id: Option<u32>,
        online: bool,
    ) -> Result<(), StoreError>;

    async fn reset_online_flags(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// MySQL
// ---------------------------------------------------------------------------

pub struct MySqlStore {
    pool: MySqlPool,
    tables: TableConfig,
}

fn bind_args<'q>(
    mut q: Query<'q, MySql, MySqlArguments>,
    args: &'q [Arg],
) -> Query<'q, MySql, MySqlArguments> {
    for a in args {
        q = match a {
            Arg::U64(v) => q.bind(*v),
            Arg::I64(v) => q.bind(*v),
            Arg::Str(s) => q.bind(s.as_str()),
            Arg::Bytes(b) => q.bind(b.as_slice()),
        };
    }
    q
}

/// A missing or mistyped column is an error, never a silent zero.
fn col<'r, T>(row: &'r MySqlRow, name: &str) -> Result<T, sqlx::Error>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get(name)
}

fn point(row: &MySqlRow, zone: &str, x: &str, y: &str) -> Result<Point, sqlx::Error> {
    Ok(Point { zone: col(row, zone)?, x: col(row, x)?, y: col(row, y)? })
}

fn guild_member_row(r: &MySqlRow) -> Result<GuildMember, sqlx::Error> {
    Ok(GuildMember {
        account_id: col(r, "account_id")?,
        char_id: col(r, "char_id")?,
        hair: col(r, "hair")?,
        hair_color: col(r, "hair_color")?,
        gender: col(r, "gender")?,
        class: col(r, "class")?,
        lv: col(r, "lv")?,
        exp: col(r, "exp")?,
        online: false,
        position: col(r, "position")?,
        name: col(r, "name")?,
    })
}

fn skill_row(r: &MySqlRow) -> Result<Skill, sqlx::Error> {
    Ok(Skill { id: col(r, "id")?, lv: col(r, "lv")?, flag: col(r, "flag")? })
}

fn friend_row(r: &MySqlRow) -> Result<Friend, sqlx::Error> {
    Ok(Friend {
        account_id: col(r, "friend_account")?,
        char_id: col(r, "friend_id")?,
        // the friend's character may be gone
        name: col::<Option<String>>(r, "name")?.unwrap_or_default(),
    })
}

fn hotkey_row(r: &MySqlRow) -> Result<Hotkey, sqlx::Error> {
    Ok(Hotkey {
        slot: col(r, "hotkey")?,
        kind: col(r, "type")?,
        id: col(r, "itemskill_id")?,
        lv: col(r, "skill_lvl")?,
    })
}

fn summary_row(r: &MySqlRow) -> Result<CharSummary, sqlx::Error> {
    Ok(CharSummary {
        char_id: col(r, "char_id")?,
        slot: col(r, "char_num")?,
        name: col(r, "name")?,
        class: col(r, "class")?,
        base_level: col(r, "base_level")?,
        last_point: point(r, "last_zone", "last_x", "last_y")?,
    })
}

fn alliance_row(r: &MySqlRow) -> Result<GuildAlliance, sqlx::Error> {
    Ok(GuildAlliance {
        opposition: col::<u8>(r, "opposition")? != 0,
        guild_id: col(r, "alliance_id")?,
        name: col(r, "name")?,
    })
}

fn expulsion_row(r: &MySqlRow) -> Result<GuildExpulsion, sqlx::Error> {
    Ok(GuildExpulsion {
        account_id: col(r, "account_id")?,
        char_id: col(r, "char_id")?,
        name: col(r, "name")?,
        mes: col(r, "mes")?,
    })
}

fn party_member_row(r: &MySqlRow) -> Result<PartyMember, sqlx::Error> {
    Ok(PartyMember {
        account_id: col(r, "account_id")?,
        char_id: col(r, "char_id")?,
        name: col(r, "name")?,
        class: col(r, "class")?,
        lv: col(r, "lv")?,
        leader: col::<u8>(r, "leader")? != 0,
        ..Default::default()
    })
}

impl MySqlStore {
    pub fn new(pool: MySqlPool, tables: TableConfig) -> Self {
        Self { pool, tables }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn load_guild_members(&self, guild_id: u32) -> Result<Vec<GuildMember>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT `account_id`, `char_id`, `hair`, `hair_color`, `gender`, `class`, `lv`, \
             `exp`, `position`, `name` FROM `{}` WHERE `guild_id` = ? ORDER BY `position`, `char_id`",
            self.tables.guild_member
        ))
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(guild_member_row).collect()
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn execute(&self, stmt: &Statement) -> Result<u64, StoreError> {
        let res = bind_args(sqlx::query(&stmt.sql), &stmt.args).execute(&self.pool).await?;
        Ok(res.rows_affected())
    }

    async fn execute_atomic(&self, stmts: &[Statement]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for s in stmts {
            bind_args(sqlx::query(&s.sql), &s.args).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_char(&self, char_id: u32) -> Result<Option<CharRecord>, StoreError> {
        let t = &self.tables;
        let row = sqlx::query(&format!("SELECT * FROM `{}` WHERE `char_id` = ? LIMIT 1", t.char))
            .bind(char_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };

        let mut c = CharRecord::new(char_id, col(&row, "account_id")?);
        c.slot = col(&row, "char_num")?;

        let v = &mut c.vitals;
        v.base_level = col(&row, "base_level")?;
        v.job_level = col(&row, "job_level")?;
        v.base_exp = col(&row, "base_exp")?;
        v.job_exp = col(&row, "job_exp")?;
        v.zeny = col(&row, "zeny")?;
        v.hp = col(&row, "hp")?;
        v.max_hp = col(&row, "max_hp")?;
        v.sp = col(&row, "sp")?;
        v.max_sp = col(&row, "max_sp")?;
        v.status_point = col(&row, "status_point")?;
        v.skill_point = col(&row, "skill_point")?;
        for (i, name) in ["str", "agi", "vit", "int", "dex", "luk"].iter().enumerate() {
            v.stats[i] = col(&row, name)?;
        }
        v.option = col(&row, "option")?;
        v.last_point = point(&row, "last_zone", "last_x", "last_y")?;
        v.karma = col(&row, "karma")?;
        v.manner = col(&row, "manner")?;

        let p = &mut c.profile;
        p.name = col(&row, "name")?;
        p.class = col(&row, "class")?;
        p.sex = col(&row, "sex")?;
        p.hair = col(&row, "hair")?;
        p.hair_color = col(&row, "hair_color")?;
        p.clothes_color = col(&row, "clothes_color")?;
        p.weapon = col(&row, "weapon")?;
        p.shield = col(&row, "shield")?;
        p.head_top = col(&row, "head_top")?;
        p.head_mid = col(&row, "head_mid")?;
        p.head_bottom = col(&row, "head_bottom")?;
        p.party_id = col(&row, "party_id")?;
        p.guild_id = col(&row, "guild_id")?;
        p.partner_id = col(&row, "partner_id")?;
        p.father = col(&row, "father")?;
        p.mother = col(&row, "mother")?;
        p.child = col(&row, "child")?;
        p.save_point = point(&row, "save_zone", "save_x", "save_y")?;

        let rows = sqlx::query(&format!(
            "SELECT `zone`, `x`, `y` FROM `{}` WHERE `char_id` = ? ORDER BY `idx`",
            t.memo
        ))
        .bind(char_id)
        .fetch_all(&self.pool)
        .await?;
        c.memo = rows.iter().map(|r| point(r, "zone", "x", "y")).collect::<Result<_, _>>()?;

        let rows = sqlx::query(&format!("SELECT `id`, `lv`, `flag` FROM `{}` WHERE `char_id` = ?", t.skill))
            .bind(char_id)
            .fetch_all(&self.pool)
            .await?;
        c.skills = rows.iter().map(skill_row).collect::<Result<_, _>>()?;

        let rows = sqlx::query(&format!(
            "SELECT f.`friend_account`, f.`friend_id`, c.`name` FROM `{}` f \
             LEFT JOIN `{}` c ON c.`char_id` = f.`friend_id` WHERE f.`char_id` = ?",
            t.friends, t.char
        ))
        .bind(char_id)
        .fetch_all(&self.pool)
        .await?;
        c.friends = rows.iter().map(friend_row).collect::<Result<_, _>>()?;

        let rows = sqlx::query(&format!(
            "SELECT `hotkey`, `type`, `itemskill_id`, `skill_lvl` FROM `{}` WHERE `char_id` = ? ORDER BY `hotkey`",
            t.hotkey
        ))
        .bind(char_id)
        .fetch_all(&self.pool)
        .await?;
        c.hotkeys = rows.iter().map(hotkey_row).collect::<Result<_, _>>()?;

        Ok(Some(c))
    }

    async fn load_char_list(&self, account_id: u32) -> Result<Vec<CharSummary>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT `char_id`, `char_num`, `name`, `class`, `base_level`, `last_zone`, `last_x`, `last_y` \
             FROM `{}` WHERE `account_id` = ? ORDER BY `char_num`",
            self.tables.char
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(summary_row).collect::<Result<_, _>>()?)
    }

    async fn load_affiliation(&self, char_id: u32) -> Result<Option<(u32, u32)>, StoreError> {
        let row: Option<(u32, u32)> = sqlx::query_as(&format!(
            "SELECT `party_id`, `guild_id` FROM `{}` WHERE `char_id` = ?",
            self.tables.char
        ))
        .bind(char_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn load_guild(&self, guild_id: u32) -> Result<Option<Guild>, StoreError> {
        let t = &self.tables;
        let row = sqlx::query(&format!("SELECT * FROM `{}` WHERE `guild_id` = ? LIMIT 1", t.guild))
            .bind(guild_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };

        let mut g = Guild::new(guild_id, col(&row, "name")?, col(&row, "master")?);
        g.guild_lv = col(&row, "guild_lv")?;
        g.max_member = col(&row, "max_member")?;
        g.exp = col(&row, "exp")?;
        g.skill_point = col(&row, "skill_point")?;
        g.mes1 = col(&row, "mes1")?;
        g.mes2 = col(&row, "mes2")?;
        g.emblem_id = col(&row, "emblem_id")?;
        g.emblem = col::<Option<Vec<u8>>>(&row, "emblem_data")?.unwrap_or_default();
        g.members = self.load_guild_members(guild_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT `position`, `name`, `mode`, `exp_mode` FROM `{}` WHERE `guild_id` = ? ORDER BY `position`",
            t.guild_position
        ))
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await?;
        for r in &rows {
            let idx: u8 = col(r, "position")?;
            if let Some(p) = g.positions.get_mut(idx as usize) {
                *p = GuildPosition { name: col(r, "name")?, mode: col(r, "mode")?, exp_mode: col(r, "exp_mode")? };
            }
        }

        let rows = sqlx::query(&format!(
            "SELECT `opposition`, `alliance_id`, `name` FROM `{}` WHERE `guild_id` = ?",
            t.guild_alliance
        ))
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await?;
        g.alliances = rows.iter().map(alliance_row).collect::<Result<_, _>>()?;

        let rows = sqlx::query(&format!(
            "SELECT `account_id`, `char_id`, `name`, `mes` FROM `{}` WHERE `guild_id` = ?",
            t.guild_expulsion
        ))
        .bind(guild_id)
        .fetch_all(&self.pool)
        .await?;
        g.expulsions = rows.iter().map(expulsion_row).collect::<Result<_, _>>()?;

        let rows = sqlx::query(&format!("SELECT `id`, `lv` FROM `{}` WHERE `guild_id` = ?", t.guild_skill))
            .bind(guild_id)
            .fetch_all(&self.pool)
            .await?;
        for r in &rows {
            let id: u16 = col(r, "id")?;
            let lv: u8 = col(r, "lv")?;
            if let Some(s) = g.skills.iter_mut().find(|s| s.id == id) {
                s.lv = lv;
            } else {
                g.skills.push(GuildSkill { id, lv });
            }
        }

        g.calc_info();
        Ok(Some(g))
    }

    async fn load_party(&self, party_id: u32) -> Result<Option<Party>, StoreError> {
        let t = &self.tables;
        let row = sqlx::query(&format!(
            "SELECT `name`, `exp`, `item` FROM `{}` WHERE `party_id` = ? LIMIT 1",
            t.party
        ))
        .bind(party_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };

        let mut p = Party::new(party_id, col(&row, "name")?);
        p.exp_share = col(&row, "exp")?;
        p.item_share = col(&row, "item")?;

        let rows = sqlx::query(&format!(
            "SELECT `account_id`, `char_id`, `name`, `class`, `lv`, `leader` FROM `{}` WHERE `party_id` = ?",
            t.party_member
        ))
        .bind(party_id)
        .fetch_all(&self.pool)
        .await?;
        p.members = rows.iter().take(party::MAX_PARTY).map(party_member_row).collect::<Result<_, _>>()?;
        p.calc_share_window();
        Ok(Some(p))
    }

    async fn guild_name_taken(&self, name: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM `{}` WHERE `name` = ?",
            self.tables.guild
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(n,)| n > 0).unwrap_or(false))
    }

    async fn create_guild(&self, g: &Guild) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(&format!(
            "INSERT INTO `{}` (`name`, `master`, `guild_lv`, `connect_member`, `max_member`, \
             `average_lv`, `exp`, `next_exp`, `skill_point`, `mes1`, `mes2`, `emblem_id`) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.tables.guild
        ))
        .bind(g.name.as_str())
        .bind(g.master.as_str())
        .bind(g.guild_lv)
        .bind(g.connect_member)
        .bind(g.max_member)
        .bind(g.average_lv)
        .bind(g.exp)
        .bind(g.next_exp)
        .bind(g.skill_point)
        .bind(g.mes1.as_str())
        .bind(g.mes2.as_str())
        .bind(g.emblem_id)
        .execute(&mut *tx)
        .await?;
        let guild_id = res.last_insert_id() as u32;

        let mut created = g.clone();
        created.guild_id = guild_id;
        for aspect in [guild::MEMBER, guild::POSITION, guild::SKILL] {
            for s in created.aspect_statements(&self.tables, aspect) {
                bind_args(sqlx::query(&s.sql), &s.args).execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(guild_id)
    }

    async fn create_party(&self, p: &Party) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(&format!(
            "INSERT INTO `{}` (`name`, `exp`, `item`) VALUES (?, ?, ?)",
            self.tables.party
        ))
        .bind(p.name.as_str())
        .bind(p.exp_share)
        .bind(p.item_share)
        .execute(&mut *tx)
        .await?;
        let party_id = res.last_insert_id() as u32;

        let mut created = p.clone();
        created.party_id = party_id;
        for s in created.aspect_statements(&self.tables, party::MEMBER) {
            bind_args(sqlx::query(&s.sql), &s.args).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(party_id)
    }

    async fn set_online_flag(
        &self,
        account_id: u32,
        char_id: Option<u32>,
        online: bool,
    ) -> Result<(), StoreError> {
        let (key, id) = match char_id {
            Some(cid) => ("char_id", cid),
            None => ("account_id", account_id),
        };
        let sql = format!("UPDATE `{}` SET `online` = ? WHERE `{key}` = ?", self.tables.char);
        sqlx::query(&sql).bind(online as u8).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn reset_online_flags(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "UPDATE `{}` SET `online` = 0 WHERE `online` <> 0",
            self.tables.char
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    log: Vec<Statement>,
    fail: Vec<String>,
    chars: HashMap<u32, CharRecord>,
    guilds: HashMap<u32, Guild>,
    parties: HashMap<u32, Party>,
    online: HashSet<u32>,
    next_guild_id: u32,
    next_party_id: u32,
}

impl MemoryInner {
    fn rejects(&self, stmt: &Statement) -> Option<String> {
        self.fail
            .iter()
            .find(|p| stmt.group == p.as_str() || stmt.sql.contains(p.as_str()))
            .cloned()
    }
}

/// Store that keeps loaded rows in maps and only records writes.
///
/// Rows are seeded with [`MemoryStore::insert_char`] and friends. Statements
/// are never interpreted, so a persisted record is not visible to a later
/// load; tests inspect [`MemoryStore::statements`] instead.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_char(&self, c: CharRecord) {
        self.lock().chars.insert(c.char_id, c);
    }

    pub fn insert_guild(&self, g: Guild) {
        let mut inner = self.lock();
        inner.next_guild_id = inner.next_guild_id.max(g.guild_id);
        inner.guilds.insert(g.guild_id, g);
    }

    pub fn insert_party(&self, p: Party) {
        let mut inner = self.lock();
        inner.next_party_id = inner.next_party_id.max(p.party_id);
        inner.parties.insert(p.party_id, p);
    }

    /// Every later statement whose group equals `pattern` or whose SQL
    /// contains it fails with [`StoreError::Rejected`].
    pub fn fail_matching(&self, pattern: &str) {
        self.lock().fail.push(pattern.to_owned());
    }

    pub fn clear_failures(&self) {
        self.lock().fail.clear();
    }

    /// Statements applied so far, in order.
    pub fn statements(&self) -> Vec<Statement> {
        self.lock().log.clone()
    }

    pub fn take_statements(&self) -> Vec<Statement> {
        std::mem::take(&mut self.lock().log)
    }

    pub fn is_online(&self, char_id: u32) -> bool {
        self.lock().online.contains(&char_id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(&self, stmt: &Statement) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        if let Some(p) = inner.rejects(stmt) {
            return Err(StoreError::Rejected(p));
        }
        inner.log.push(stmt.clone());
        Ok(1)
    }

    async fn execute_atomic(&self, stmts: &[Statement]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(p) = stmts.iter().find_map(|s| inner.rejects(s)) {
            return Err(StoreError::Rejected(p));
        }
        inner.log.extend(stmts.iter().cloned());
        Ok(())
    }

    async fn load_char(&self, char_id: u32) -> Result<Option<CharRecord>, StoreError> {
        Ok(self.lock().chars.get(&char_id).cloned())
    }

    async fn load_char_list(&self, account_id: u32) -> Result<Vec<CharSummary>, StoreError> {
        let mut list: Vec<CharSummary> = self
            .lock()
            .chars
            .values()
            .filter(|c| c.account_id == account_id)
            .map(CharRecord::summary)
            .collect();
        list.sort_by_key(|c| c.slot);
        Ok(list)
    }

    async fn load_affiliation(&self, char_id: u32) -> Result<Option<(u32, u32)>, StoreError> {
        Ok(self.lock().chars.get(&char_id).map(|c| (c.profile.party_id, c.profile.guild_id)))
    }

    async fn load_guild(&self, guild_id: u32) -> Result<Option<Guild>, StoreError> {
        Ok(self.lock().guilds.get(&guild_id).cloned())
    }

    async fn load_party(&self, party_id: u32) -> Result<Option<Party>, StoreError> {
        Ok(self.lock().parties.get(&party_id).cloned())
    }

    async fn guild_name_taken(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.lock().guilds.values().any(|g| g.name == name))
    }

    async fn create_guild(&self, g: &Guild) -> Result<u32, StoreError> {
        let mut inner = self.lock();
        let stmt = Statement::new("create", "INSERT INTO guild").arg(g.name.as_str());
        if let Some(p) = inner.rejects(&stmt) {
            return Err(StoreError::Rejected(p));
        }
        inner.next_guild_id += 1;
        let id = inner.next_guild_id;
        let mut created = g.clone();
        created.guild_id = id;
        inner.guilds.insert(id, created);
        inner.log.push(stmt);
        Ok(id)
    }

    async fn create_party(&self, p: &Party) -> Result<u32, StoreError> {
        let mut inner = self.lock();
        let stmt = Statement::new("create", "INSERT INTO party").arg(p.name.as_str());
        if let Some(pat) = inner.rejects(&stmt) {
            return Err(StoreError::Rejected(pat));
        }
        inner.next_party_id += 1;
        let id = inner.next_party_id;
        let mut created = p.clone();
        created.party_id = id;
        inner.parties.insert(id, created);
        inner.log.push(stmt);
        Ok(id)
    }

    async fn set_online_flag(
        &self,
        account_id: u32,
        char_id: Option<u32>,
        online: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let stmt = Statement::new("online", "UPDATE char SET online").arg(account_id);
        if let Some(p) = inner.rejects(&stmt) {
            return Err(StoreError::Rejected(p));
        }
        let ids: Vec<u32> = match char_id {
            Some(cid) => vec![cid],
            None => inner.chars.values().filter(|c| c.account_id == account_id).map(|c| c.char_id).collect(),
        };
        for id in ids {
            if online {
                inner.online.insert(id);
            } else {
                inner.online.remove(&id);
            }
        }
        Ok(())
    }

    async fn reset_online_flags(&self) -> Result<(), StoreError> {
        self.lock().online.clear();
        Ok(())
    }
}
