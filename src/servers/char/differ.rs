//! Diff-based character persistence.
//!
//! The hub keeps the last successfully written copy of every character it
//! has loaded or saved (the baseline). Saving compares the new record with
//! the baseline one field group at a time and writes only the groups that
//! changed: a single `UPDATE` for a scalar group, a delete-then-insert pair
//! for a collection. The baseline is replaced only when every write
//! succeeded.

use std::collections::HashMap;

use crate::config::TableConfig;

use super::charstatus::{CharRecord, Profile, Vitals};
use super::db::{Arg, Statement, Store, StoreError};
use super::hub::Hub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Vitals,
    Profile,
    Memo,
    Skills,
    Friends,
    Hotkeys,
}

impl Group {
    pub const ALL: [Group; 6] = [
        Group::Vitals,
        Group::Profile,
        Group::Memo,
        Group::Skills,
        Group::Friends,
        Group::Hotkeys,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Group::Vitals => "vitals",
            Group::Profile => "profile",
            Group::Memo => "memo",
            Group::Skills => "skills",
            Group::Friends => "friends",
            Group::Hotkeys => "hotkeys",
        }
    }
}

const VITALS_COLS: &[&str] = &[
    "base_level", "job_level", "base_exp", "job_exp", "zeny", "hp", "max_hp", "sp", "max_sp",
    "status_point", "skill_point", "str", "agi", "vit", "int", "dex", "luk", "option",
    "last_zone", "last_x", "last_y", "karma", "manner",
];

const PROFILE_COLS: &[&str] = &[
    "name", "class", "sex", "hair", "hair_color", "clothes_color", "weapon", "shield", "head_top",
    "head_mid", "head_bottom", "party_id", "guild_id", "partner_id", "father", "mother", "child",
    "save_zone", "save_x", "save_y",
];

fn vitals_args(v: &Vitals) -> Vec<Arg> {
    let mut a: Vec<Arg> = vec![
        v.base_level.into(),
        v.job_level.into(),
        v.base_exp.into(),
        v.job_exp.into(),
        v.zeny.into(),
        v.hp.into(),
        v.max_hp.into(),
        v.sp.into(),
        v.max_sp.into(),
        v.status_point.into(),
        v.skill_point.into(),
    ];
    a.extend(v.stats.iter().map(|&s| Arg::from(s)));
    a.push(v.option.into());
    a.push(v.last_point.zone.into());
    a.push(v.last_point.x.into());
    a.push(v.last_point.y.into());
    a.push(v.karma.into());
    a.push(v.manner.into());
    a
}

fn profile_args(p: &Profile) -> Vec<Arg> {
    vec![
        p.name.as_str().into(),
        p.class.into(),
        p.sex.into(),
        p.hair.into(),
        p.hair_color.into(),
        p.clothes_color.into(),
        p.weapon.into(),
        p.shield.into(),
        p.head_top.into(),
        p.head_mid.into(),
        p.head_bottom.into(),
        p.party_id.into(),
        p.guild_id.into(),
        p.partner_id.into(),
        p.father.into(),
        p.mother.into(),
        p.child.into(),
        p.save_point.zone.into(),
        p.save_point.x.into(),
        p.save_point.y.into(),
    ]
}

/// Delete every row of `char_id` in `table`, then bulk-insert `rows`.
fn replace_rows(group: Group, table: &str, char_id: u32, columns: &[&str], rows: Vec<Vec<Arg>>) -> Vec<Statement> {
    let mut v = vec![Statement::new(group.name(), format!("DELETE FROM `{table}` WHERE `char_id` = ?")).arg(char_id)];
    v.extend(Statement::bulk_insert(group.name(), table, columns, rows));
    v
}

/// Statements persisting one group of `rec`.
pub fn group_statements(tables: &TableConfig, group: Group, rec: &CharRecord) -> Vec<Statement> {
    let cid = rec.char_id;
    match group {
        Group::Vitals => vec![Statement::update(
            group.name(),
            &tables.char,
            VITALS_COLS,
            vitals_args(&rec.vitals),
            "char_id",
            cid,
        )],
        Group::Profile => vec![Statement::update(
            group.name(),
            &tables.char,
            PROFILE_COLS,
            profile_args(&rec.profile),
            "char_id",
            cid,
        )],
        Group::Memo => replace_rows(
            group,
            &tables.memo,
            cid,
            &["char_id", "idx", "zone", "x", "y"],
            rec.memo
                .iter()
                .enumerate()
                .map(|(i, m)| vec![cid.into(), (i as u32).into(), m.zone.into(), m.x.into(), m.y.into()])
                .collect(),
        ),
        Group::Skills => replace_rows(
            group,
            &tables.skill,
            cid,
            &["char_id", "id", "lv", "flag"],
            rec.skills
                .iter()
                .filter(|s| s.id != 0)
                .map(|s| vec![cid.into(), s.id.into(), s.lv.into(), s.flag.into()])
                .collect(),
        ),
        Group::Friends => replace_rows(
            group,
            &tables.friends,
            cid,
            &["char_id", "friend_account", "friend_id"],
            rec.friends
                .iter()
                .filter(|f| f.char_id != 0)
                .map(|f| vec![cid.into(), f.account_id.into(), f.char_id.into()])
                .collect(),
        ),
        Group::Hotkeys => replace_rows(
            group,
            &tables.hotkey,
            cid,
            &["char_id", "hotkey", "type", "itemskill_id", "skill_lvl"],
            rec.hotkeys
                .iter()
                .map(|h| vec![cid.into(), h.slot.into(), h.kind.into(), h.id.into(), h.lv.into()])
                .collect(),
        ),
    }
}

fn group_differs(group: Group, old: &CharRecord, new: &CharRecord) -> bool {
    match group {
        Group::Vitals => old.vitals != new.vitals,
        Group::Profile => old.profile != new.profile,
        Group::Memo => old.memo != new.memo,
        Group::Skills => old.skills != new.skills,
        Group::Friends => old.friends != new.friends,
        Group::Hotkeys => old.hotkeys != new.hotkeys,
    }
}

/// Groups of `new` that differ from `old`, with the statements to write them.
pub fn diff(tables: &TableConfig, old: &CharRecord, new: &CharRecord) -> Vec<(Group, Vec<Statement>)> {
    Group::ALL
        .into_iter()
        .filter(|&g| group_differs(g, old, new))
        .map(|g| (g, group_statements(tables, g, new)))
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub written: Vec<Group>,
    pub failed: Vec<Group>,
}

impl PersistOutcome {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Baselines keyed by character id.
#[derive(Debug, Default)]
pub struct Differ {
    baselines: HashMap<u32, CharRecord>,
    failures: u64,
}

impl Differ {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    pub fn baseline(&self, char_id: u32) -> Option<&CharRecord> {
        self.baselines.get(&char_id)
    }

    /// Total failed group writes since startup.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Installs a freshly loaded record as the baseline.
    pub fn adopt(&mut self, rec: CharRecord) {
        self.baselines.insert(rec.char_id, rec);
    }

    pub fn drop_baseline(&mut self, char_id: u32) -> Option<CharRecord> {
        self.baselines.remove(&char_id)
    }

    /// Characters of `account_id` with a resident baseline.
    pub fn account_chars(&self, account_id: u32) -> Vec<u32> {
        let mut v: Vec<u32> = self
            .baselines
            .values()
            .filter(|c| c.account_id == account_id)
            .map(|c| c.char_id)
            .collect();
        v.sort_unstable();
        v
    }

    /// Returns the baseline, loading it from the store on first use.
    pub async fn load(&mut self, store: &dyn Store, char_id: u32) -> Result<Option<&CharRecord>, StoreError> {
        if !self.baselines.contains_key(&char_id) {
            match store.load_char(char_id).await? {
                Some(rec) => {
                    self.baselines.insert(char_id, rec);
                }
                None => return Ok(None),
            }
        }
        Ok(self.baselines.get(&char_id))
    }

    /// Writes the groups of `new` that differ from its baseline. A missing
    /// baseline is a zeroed record with the same ids. Every group is tried
    /// even after a failure; the baseline only advances if none failed.
    pub async fn persist(&mut self, store: &dyn Store, tables: &TableConfig, new: CharRecord) -> PersistOutcome {
        let cid = new.char_id;
        let changes = match self.baselines.get(&cid) {
            Some(old) => diff(tables, old, &new),
            None => diff(tables, &CharRecord::new(cid, new.account_id), &new),
        };

        let mut out = PersistOutcome::default();
        for (group, stmts) in changes {
            let res = match stmts.as_slice() {
                [one] => store.execute(one).await.map(|_| ()),
                many => store.execute_atomic(many).await,
            };
            match res {
                Ok(()) => out.written.push(group),
                Err(e) => {
                    self.failures += 1;
                    tracing::error!(
                        "[char] [differ] char {} group {} not saved: {}",
                        cid,
                        group.name(),
                        e
                    );
                    out.failed.push(group);
                }
            }
        }

        if out.is_ok() {
            self.baselines.insert(cid, new);
        }
        out
    }
}

impl Hub {
    /// `0x3004`: a map server saves a character. Saves from a map server that
    /// no longer owns the character are refused unless final or reconnect.
    pub async fn save_char(
        &mut self,
        slot: usize,
        account_id: u32,
        record: CharRecord,
        is_final: bool,
        reconnect: bool,
    ) {
        let char_id = record.char_id;
        let owns = self
            .online
            .get(account_id)
            .is_some_and(|r| r.char_id == Some(char_id));

        if is_final || reconnect || owns {
            let out = self.chars.persist(self.store.as_ref(), &self.config.tables, record).await;
            if !out.written.is_empty() {
                tracing::debug!(
                    "[char] [differ] char {} saved groups {:?}",
                    char_id,
                    out.written.iter().map(|g| g.name()).collect::<Vec<_>>()
                );
            }
        } else {
            tracing::warn!(
                "[char] [differ] map server #{} saved char {}:{} it does not own; not saved",
                slot,
                account_id,
                char_id
            );
            self.mark_online(slot, char_id, account_id).await;
        }

        if is_final {
            self.mark_offline(Some(char_id), account_id).await;
            let ack = super::dispatch::PacketBuilder::new(0x3807).u32(account_id).u32(char_id).finish();
            self.send_to_slot(slot, ack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::char::charstatus::{sample, Point, Skill};
    use crate::servers::char::db::MemoryStore;

    #[tokio::test]
    async fn test_one_vitals_change_is_one_statement() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let mut d = Differ::new();
        let a = sample(7, 42);
        d.adopt(a.clone());

        let mut b = a.clone();
        b.vitals.zeny += 10;
        let out = d.persist(&store, &tables, b.clone()).await;
        assert_eq!(out.written, vec![Group::Vitals]);
        let stmts = store.statements();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].group, "vitals");
        assert!(stmts[0].sql.starts_with("UPDATE `char` SET `base_level` = ?"));
        assert_eq!(d.baseline(7), Some(&b));
    }

    #[tokio::test]
    async fn test_reloaded_baseline_yields_no_statements() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let a = sample(7, 42);

        let mut d = Differ::new();
        d.persist(&store, &tables, a.clone()).await;
        store.take_statements();

        let mut rebuilt = Differ::new();
        rebuilt.adopt(a.clone());
        let out = rebuilt.persist(&store, &tables, a).await;
        assert!(out.written.is_empty());
        assert!(store.statements().is_empty());
    }

    #[test]
    fn test_collection_change_is_delete_then_insert() {
        let tables = TableConfig::default();
        let a = sample(7, 42);
        let mut b = a.clone();
        b.skills.push(Skill { id: 142, lv: 1, flag: 0 });
        let changes = diff(&tables, &a, &b);
        assert_eq!(changes.len(), 1);
        let (group, stmts) = &changes[0];
        assert_eq!(*group, Group::Skills);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].sql.starts_with("DELETE FROM `skill`"));
        assert!(stmts[1].sql.starts_with("INSERT INTO `skill`"));
        assert_eq!(stmts[1].args.len(), 3 * 4);
    }

    #[test]
    fn test_emptied_collection_is_delete_only() {
        let tables = TableConfig::default();
        let a = sample(7, 42);
        let mut b = a.clone();
        b.memo.clear();
        let changes = diff(&tables, &a, &b);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].1.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_baseline_is_zeroed_record() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let mut d = Differ::new();
        let mut a = CharRecord::new(9, 42);
        a.vitals.hp = 5;
        let out = d.persist(&store, &tables, a).await;
        assert_eq!(out.written, vec![Group::Vitals]);
    }

    #[tokio::test]
    async fn test_failed_group_keeps_baseline() {
        let store = MemoryStore::new();
        let tables = TableConfig::default();
        let mut d = Differ::new();
        let a = sample(7, 42);
        d.adopt(a.clone());

        let mut b = a.clone();
        b.vitals.zeny = 1;
        b.memo.push(Point { zone: 8, x: 8, y: 8 });
        store.fail_matching("memo");
        let out = d.persist(&store, &tables, b.clone()).await;
        assert_eq!(out.written, vec![Group::Vitals]);
        assert_eq!(out.failed, vec![Group::Memo]);
        assert_eq!(d.failures(), 1);
        assert_eq!(d.baseline(7), Some(&a));

        // the retry re-diffs against the pre-failure state
        store.clear_failures();
        store.take_statements();
        let out = d.persist(&store, &tables, b.clone()).await;
        assert_eq!(out.written, vec![Group::Vitals, Group::Memo]);
        assert_eq!(d.baseline(7), Some(&b));
    }

    #[tokio::test]
    async fn test_load_caches_baseline() {
        let store = MemoryStore::new();
        store.insert_char(sample(7, 42));
        let mut d = Differ::new();
        assert!(d.load(&store, 7).await.unwrap().is_some());
        assert!(d.load(&store, 8).await.unwrap().is_none());
        assert_eq!(d.account_chars(42), vec![7]);
        d.drop_baseline(7);
        assert!(d.is_empty());
    }
}
