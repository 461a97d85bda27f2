//! Character record as carried between the hub and map servers.
//!
//! The record is split into the field groups the persistence differ works
//! on: [`Vitals`] changes on nearly every save, [`Profile`] rarely, and the
//! four collections have no per-element identity on the wire. Map servers
//! send it zlib-compressed inside `0x3004`; the hub sends it back the same
//! way inside `0x3803`.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::dispatch::{write_str_padded, DispatchError, PacketReader};

pub const NAME_LENGTH: usize = 24;
pub const MAX_MEMOPOINTS: usize = 3;
pub const MAX_SKILLS: usize = 512;
pub const MAX_FRIENDS: usize = 40;
pub const MAX_HOTKEYS: usize = 38;

/// Largest decompressed record accepted from a map server.
const MAX_RECORD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
    pub zone: u16,
    pub x: u16,
    pub y: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Skill {
    pub id: u16,
    pub lv: u8,
    pub flag: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Friend {
    pub account_id: u32,
    pub char_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hotkey {
    pub slot: u8,
    pub kind: u8,
    pub id: u32,
    pub lv: u16,
}

/// Frequently-changing counters and position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vitals {
    pub base_level: u16,
    pub job_level: u16,
    pub base_exp: u64,
    pub job_exp: u64,
    pub zeny: u32,
    pub hp: u32,
    pub max_hp: u32,
    pub sp: u32,
    pub max_sp: u32,
    pub status_point: u32,
    pub skill_point: u32,
    /// str, agi, vit, int, dex, luk
    pub stats: [u16; 6],
    pub option: u32,
    pub last_point: Point,
    pub karma: i32,
    pub manner: i32,
}

/// Identity, appearance and relationships.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub class: u16,
    pub sex: u8,
    pub hair: u16,
    pub hair_color: u16,
    pub clothes_color: u16,
    pub weapon: u16,
    pub shield: u16,
    pub head_top: u16,
    pub head_mid: u16,
    pub head_bottom: u16,
    pub party_id: u32,
    pub guild_id: u32,
    pub partner_id: u32,
    pub father: u32,
    pub mother: u32,
    pub child: u32,
    pub save_point: Point,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharRecord {
    pub char_id: u32,
    pub account_id: u32,
    pub slot: u8,
    pub vitals: Vitals,
    pub profile: Profile,
    pub memo: Vec<Point>,
    pub skills: Vec<Skill>,
    pub friends: Vec<Friend>,
    pub hotkeys: Vec<Hotkey>,
}

/// One row of the character-select list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharSummary {
    pub char_id: u32,
    pub slot: u8,
    pub name: String,
    pub class: u16,
    pub base_level: u16,
    pub last_point: Point,
}

fn put_point(buf: &mut BytesMut, p: &Point) {
    buf.put_u16_le(p.zone);
    buf.put_u16_le(p.x);
    buf.put_u16_le(p.y);
}

fn get_point(rd: &mut PacketReader<'_>) -> Result<Point, DispatchError> {
    Ok(Point { zone: rd.u16()?, x: rd.u16()?, y: rd.u16()? })
}

fn get_count(rd: &mut PacketReader<'_>, max: usize) -> Result<usize, DispatchError> {
    let n = rd.u16()? as usize;
    if n > max {
        return Err(DispatchError::BadLength { link: "record", cmd: 0, len: n });
    }
    Ok(n)
}

impl CharRecord {
    /// Zeroed record carrying only its ids. Used as the baseline for a
    /// character the hub has never persisted.
    pub fn new(char_id: u32, account_id: u32) -> Self {
        Self { char_id, account_id, ..Default::default() }
    }

    pub fn summary(&self) -> CharSummary {
        CharSummary {
            char_id: self.char_id,
            slot: self.slot,
            name: self.profile.name.clone(),
            class: self.profile.class,
            base_level: self.vitals.base_level,
            last_point: self.vitals.last_point,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_u32_le(self.char_id);
        buf.put_u32_le(self.account_id);
        buf.put_u8(self.slot);

        let v = &self.vitals;
        buf.put_u16_le(v.base_level);
        buf.put_u16_le(v.job_level);
        buf.put_u64_le(v.base_exp);
        buf.put_u64_le(v.job_exp);
        buf.put_u32_le(v.zeny);
        buf.put_u32_le(v.hp);
        buf.put_u32_le(v.max_hp);
        buf.put_u32_le(v.sp);
        buf.put_u32_le(v.max_sp);
        buf.put_u32_le(v.status_point);
        buf.put_u32_le(v.skill_point);
        for s in v.stats {
            buf.put_u16_le(s);
        }
        buf.put_u32_le(v.option);
        put_point(&mut buf, &v.last_point);
        buf.put_i32_le(v.karma);
        buf.put_i32_le(v.manner);

        let p = &self.profile;
        write_str_padded(&mut buf, &p.name, NAME_LENGTH);
        buf.put_u16_le(p.class);
        buf.put_u8(p.sex);
        buf.put_u16_le(p.hair);
        buf.put_u16_le(p.hair_color);
        buf.put_u16_le(p.clothes_color);
        buf.put_u16_le(p.weapon);
        buf.put_u16_le(p.shield);
        buf.put_u16_le(p.head_top);
        buf.put_u16_le(p.head_mid);
        buf.put_u16_le(p.head_bottom);
        buf.put_u32_le(p.party_id);
        buf.put_u32_le(p.guild_id);
        buf.put_u32_le(p.partner_id);
        buf.put_u32_le(p.father);
        buf.put_u32_le(p.mother);
        buf.put_u32_le(p.child);
        put_point(&mut buf, &p.save_point);

        buf.put_u16_le(self.memo.len() as u16);
        for m in &self.memo {
            put_point(&mut buf, m);
        }
        buf.put_u16_le(self.skills.len() as u16);
        for s in &self.skills {
            buf.put_u16_le(s.id);
            buf.put_u8(s.lv);
            buf.put_u8(s.flag);
        }
        buf.put_u16_le(self.friends.len() as u16);
        for f in &self.friends {
            buf.put_u32_le(f.account_id);
            buf.put_u32_le(f.char_id);
            write_str_padded(&mut buf, &f.name, NAME_LENGTH);
        }
        buf.put_u16_le(self.hotkeys.len() as u16);
        for h in &self.hotkeys {
            buf.put_u8(h.slot);
            buf.put_u8(h.kind);
            buf.put_u32_le(h.id);
            buf.put_u16_le(h.lv);
        }
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DispatchError> {
        let mut rd = PacketReader::body(data);
        let char_id = rd.u32()?;
        let account_id = rd.u32()?;
        let slot = rd.u8()?;

        let mut vitals = Vitals {
            base_level: rd.u16()?,
            job_level: rd.u16()?,
            base_exp: rd.u64()?,
            job_exp: rd.u64()?,
            zeny: rd.u32()?,
            hp: rd.u32()?,
            max_hp: rd.u32()?,
            sp: rd.u32()?,
            max_sp: rd.u32()?,
            status_point: rd.u32()?,
            skill_point: rd.u32()?,
            ..Default::default()
        };
        for s in vitals.stats.iter_mut() {
            *s = rd.u16()?;
        }
        vitals.option = rd.u32()?;
        vitals.last_point = get_point(&mut rd)?;
        vitals.karma = rd.u32()? as i32;
        vitals.manner = rd.u32()? as i32;

        let profile = Profile {
            name: rd.str_fixed(NAME_LENGTH)?,
            class: rd.u16()?,
            sex: rd.u8()?,
            hair: rd.u16()?,
            hair_color: rd.u16()?,
            clothes_color: rd.u16()?,
            weapon: rd.u16()?,
            shield: rd.u16()?,
            head_top: rd.u16()?,
            head_mid: rd.u16()?,
            head_bottom: rd.u16()?,
            party_id: rd.u32()?,
            guild_id: rd.u32()?,
            partner_id: rd.u32()?,
            father: rd.u32()?,
            mother: rd.u32()?,
            child: rd.u32()?,
            save_point: get_point(&mut rd)?,
        };

        let n = get_count(&mut rd, MAX_MEMOPOINTS)?;
        let mut memo = Vec::with_capacity(n);
        for _ in 0..n {
            memo.push(get_point(&mut rd)?);
        }
        let n = get_count(&mut rd, MAX_SKILLS)?;
        let mut skills = Vec::with_capacity(n);
        for _ in 0..n {
            skills.push(Skill { id: rd.u16()?, lv: rd.u8()?, flag: rd.u8()? });
        }
        let n = get_count(&mut rd, MAX_FRIENDS)?;
        let mut friends = Vec::with_capacity(n);
        for _ in 0..n {
            friends.push(Friend {
                account_id: rd.u32()?,
                char_id: rd.u32()?,
                name: rd.str_fixed(NAME_LENGTH)?,
            });
        }
        let n = get_count(&mut rd, MAX_HOTKEYS)?;
        let mut hotkeys = Vec::with_capacity(n);
        for _ in 0..n {
            hotkeys.push(Hotkey { slot: rd.u8()?, kind: rd.u8()?, id: rd.u32()?, lv: rd.u16()? });
        }

        Ok(Self { char_id, account_id, slot, vitals, profile, memo, skills, friends, hotkeys })
    }

    pub fn compress(&self) -> std::io::Result<Vec<u8>> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&self.encode())?;
        enc.finish()
    }

    pub fn decompress(data: &[u8]) -> Result<Self, DispatchError> {
        let mut raw = Vec::new();
        ZlibDecoder::new(data).take(MAX_RECORD as u64 + 1).read_to_end(&mut raw)?;
        if raw.len() > MAX_RECORD {
            return Err(DispatchError::BadLength { link: "record", cmd: 0, len: raw.len() });
        }
        Self::decode(&raw)
    }
}

#[cfg(test)]
pub(crate) fn sample(char_id: u32, account_id: u32) -> CharRecord {
    let mut r = CharRecord::new(char_id, account_id);
    r.slot = 1;
    r.vitals.base_level = 55;
    r.vitals.job_level = 30;
    r.vitals.base_exp = 1_234_567;
    r.vitals.zeny = 5000;
    r.vitals.hp = 900;
    r.vitals.max_hp = 1000;
    r.vitals.stats = [9, 8, 7, 6, 5, 4];
    r.vitals.last_point = Point { zone: 3, x: 150, y: 180 };
    r.vitals.karma = -3;
    r.profile.name = format!("Hero{char_id}");
    r.profile.class = 4;
    r.profile.sex = 1;
    r.profile.hair = 2;
    r.profile.save_point = Point { zone: 1, x: 10, y: 20 };
    r.memo = vec![Point { zone: 2, x: 1, y: 1 }, Point { zone: 5, x: 7, y: 7 }];
    r.skills = vec![Skill { id: 1, lv: 9, flag: 0 }, Skill { id: 28, lv: 10, flag: 0 }];
    r.friends = vec![Friend { account_id: 77, char_id: 700, name: "Pal".into() }];
    r.hotkeys = vec![Hotkey { slot: 0, kind: 1, id: 28, lv: 10 }];
    r
}
