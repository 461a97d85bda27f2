//! Map-server link.
//!
//! A map server opens with `0x3000`. Once registered it owns a slot until
//! its connection closes or a send finds the queue closed. Every later
//! frame is decoded here and handed to the matching [`Hub`] operation.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::charstatus::{CharRecord, Point, NAME_LENGTH};
use super::dispatch::{DispatchError, FrameReader, LengthTable, PacketBuilder, PacketReader};
use super::guild::{self, CreateGuild, GuildPosition, NewMember, MES1_LENGTH, MES2_LENGTH};
use super::handoff::{RedeemRequest, TransferRequest};
use super::hub::Hub;
use super::online::SlotRef;
use super::party::{CreateParty, PartyMember};
use super::CharState;

pub static MAPIF: LengthTable = LengthTable {
    link: "map",
    base: 0x3000,
    lens: &[
        72,  // 0x3000 register
        -1,  // 0x3001 zones
        24,  // 0x3002 redeem ticket
        35,  // 0x3003 transfer
        -1,  // 0x3004 save character
        10,  // 0x3005 character offline
        10,  // 0x3006 character online
        2,   // 0x3007 slot offline
        18,  // 0x3008 return to select
        2,   // 0x3009 keepalive
        -1,  // 0x300A ranking
        0, 0, 0, 0, 0, // 0x300B-0x300F
        62,  // 0x3010 guild create
        6,   // 0x3011 guild info
        42,  // 0x3012 guild add member
        55,  // 0x3013 guild leave
        19,  // 0x3014 guild member info
        6,   // 0x3015 guild break
        186, // 0x3016 guild notice
        -1,  // 0x3017 guild emblem
        14,  // 0x3018 guild skill up
        19,  // 0x3019 guild alliance
        39,  // 0x301A guild position
        15,  // 0x301B guild member position
        22,  // 0x301C guild exp
        30,  // 0x301D guild master change
        6,   // 0x301E guild force save
        0,   // 0x301F
        64,  // 0x3020 party create
        10,  // 0x3021 party info
        42,  // 0x3022 party add member
        14,  // 0x3023 party leave
        19,  // 0x3024 party member moved
        12,  // 0x3025 party option
        6,   // 0x3026 party break
    ],
};

const CRED_LENGTH: usize = 32;
const EXPULSION_MES_LENGTH: usize = guild::EXPULSION_MES_LENGTH;

/// `0x3000`: (id, pw, ip, port).
fn parse_register(pkt: &[u8]) -> Result<(String, String, u32, u16), DispatchError> {
    let mut rd = PacketReader::new(pkt);
    Ok((rd.str_fixed(CRED_LENGTH)?, rd.str_fixed(CRED_LENGTH)?, rd.u32()?, rd.u16()?))
}

fn register_ack(result: u8, slot: u8) -> Vec<u8> {
    PacketBuilder::new(0x3800).u8(result).u8(slot).finish()
}

impl Hub {
    /// `0x3007`: the map server is going away; its characters go offline.
    pub async fn slot_offline(&mut self, slot: usize) {
        let owned: Vec<(u32, Option<u32>)> = self
            .online
            .iter()
            .filter(|r| r.slot == SlotRef::Slot(slot))
            .map(|r| (r.account_id, r.char_id))
            .collect();
        tracing::info!("[char] [mapif] map server #{} set {} characters offline", slot, owned.len());
        for (aid, cid) in owned {
            self.mark_offline(cid, aid).await;
        }
    }
}

/// Routes one frame from the map server on `slot`.
pub async fn dispatch(hub: &mut Hub, slot: usize, pkt: &[u8]) -> Result<(), DispatchError> {
    let mut rd = PacketReader::new(pkt);
    match rd.cmd() {
        0x3001 => {
            let mut rd = PacketReader::variable(pkt);
            let n = rd.u16()? as usize;
            let zones = (0..n).map(|_| rd.u16()).collect::<Result<Vec<_>, _>>()?;
            hub.publish_zones(slot, zones);
        }
        0x3002 => {
            let req = RedeemRequest {
                account_id: rd.u32()?,
                char_id: rd.u32()?,
                login_id1: rd.u32()?,
                login_id2: rd.u32()?,
                sex: rd.u8()?,
                ip: rd.u32()?,
            };
            let unattended = rd.u8()? != 0;
            // failures are answered with 0x3804
            let _ = hub.redeem(slot, req, unattended).await;
        }
        0x3003 => {
            let req = TransferRequest {
                account_id: rd.u32()?,
                char_id: rd.u32()?,
                login_id1: rd.u32()?,
                login_id2: rd.u32()?,
                sex: rd.u8()?,
                client_ip: rd.u32()?,
                to: Point { zone: rd.u16()?, x: rd.u16()?, y: rd.u16()? },
                target_ip: rd.u32()?,
                target_port: rd.u16()?,
            };
            hub.request_transfer(slot, req).await;
        }
        0x3004 => {
            let mut rd = PacketReader::variable(pkt);
            let aid = rd.u32()?;
            let cid = rd.u32()?;
            let is_final = rd.u8()? != 0;
            let reconnect = rd.u8()? != 0;
            let record = CharRecord::decompress(rd.rest())?;
            if record.char_id != cid || record.account_id != aid {
                tracing::warn!(
                    "[char] [mapif] map server #{} sent record {}:{} under {}:{}, ignored",
                    slot,
                    record.account_id,
                    record.char_id,
                    aid,
                    cid
                );
                return Ok(());
            }
            hub.save_char(slot, aid, record, is_final, reconnect).await;
        }
        0x3005 => {
            let aid = rd.u32()?;
            let cid = rd.u32()?;
            hub.mark_offline(Some(cid), aid).await;
        }
        0x3006 => {
            let aid = rd.u32()?;
            let cid = rd.u32()?;
            hub.mark_online(slot, cid, aid).await;
        }
        0x3007 => hub.slot_offline(slot).await,
        0x3008 => {
            let aid = rd.u32()?;
            let l1 = rd.u32()?;
            let l2 = rd.u32()?;
            let ip = rd.u32()?;
            hub.return_to_select(slot, aid, l1, l2, ip);
        }
        0x3009 => {
            hub.send_to_slot(slot, PacketBuilder::new(0x380C).finish());
        }
        0x300A => {
            let mut rd = PacketReader::variable(pkt);
            let body = rd.rest();
            let kind = *body.first().ok_or(DispatchError::Short { cmd: 0x300A, pos: 6, need: 1, have: 0 })?;
            hub.update_ranking(kind, body.to_vec());
        }

        0x3010 => {
            let req = CreateGuild {
                account_id: rd.u32()?,
                char_id: rd.u32()?,
                lv: rd.u16()?,
                class: rd.u16()?,
                name: rd.str_fixed(NAME_LENGTH)?,
                master: rd.str_fixed(NAME_LENGTH)?,
            };
            hub.create_guild(slot, req).await;
        }
        0x3011 => {
            let gid = rd.u32()?;
            hub.guild_info(slot, gid).await;
        }
        0x3012 => {
            let gid = rd.u32()?;
            let m = NewMember {
                account_id: rd.u32()?,
                char_id: rd.u32()?,
                lv: rd.u16()?,
                class: rd.u16()?,
                name: rd.str_fixed(NAME_LENGTH)?,
            };
            hub.guild_add_member(slot, gid, m).await;
        }
        0x3013 => {
            let gid = rd.u32()?;
            let aid = rd.u32()?;
            let cid = rd.u32()?;
            let expelled = rd.u8()? != 0;
            let mes = rd.str_fixed(EXPULSION_MES_LENGTH)?;
            hub.guild_leave(gid, aid, cid, expelled, mes).await;
        }
        0x3014 => {
            let gid = rd.u32()?;
            let aid = rd.u32()?;
            let cid = rd.u32()?;
            let online = rd.u8()? != 0;
            let lv = rd.u16()?;
            let class = rd.u16()?;
            hub.guild_member_info(gid, aid, cid, online, lv, class).await;
        }
        0x3015 => {
            let gid = rd.u32()?;
            hub.break_guild(gid).await;
        }
        0x3016 => {
            let gid = rd.u32()?;
            let mes1 = rd.str_fixed(MES1_LENGTH)?;
            let mes2 = rd.str_fixed(MES2_LENGTH)?;
            hub.guild_notice(gid, mes1, mes2).await;
        }
        0x3017 => {
            let mut rd = PacketReader::variable(pkt);
            let gid = rd.u32()?;
            hub.guild_emblem(gid, rd.rest().to_vec()).await;
        }
        0x3018 => {
            let gid = rd.u32()?;
            let skill = rd.u16()?;
            let aid = rd.u32()?;
            let max = rd.u16()?;
            hub.guild_skill_up(gid, skill, aid, max).await;
        }
        0x3019 => {
            let g1 = rd.u32()?;
            let g2 = rd.u32()?;
            let a1 = rd.u32()?;
            let a2 = rd.u32()?;
            let flag = rd.u8()?;
            hub.guild_alliance(g1, g2, a1, a2, flag).await;
        }
        0x301A => {
            let gid = rd.u32()?;
            let index = rd.u8()?;
            let mode = rd.u32()?;
            let exp_mode = rd.u32()?;
            let name = rd.str_fixed(NAME_LENGTH)?;
            hub.guild_position(gid, index, GuildPosition { name, mode, exp_mode }).await;
        }
        0x301B => {
            let gid = rd.u32()?;
            let _aid = rd.u32()?;
            let cid = rd.u32()?;
            let index = rd.u8()?;
            hub.guild_member_position(gid, cid, index).await;
        }
        0x301C => {
            let gid = rd.u32()?;
            let _aid = rd.u32()?;
            let cid = rd.u32()?;
            let exp = rd.u64()?;
            hub.guild_exp(gid, cid, exp).await;
        }
        0x301D => {
            let gid = rd.u32()?;
            let name = rd.str_fixed(NAME_LENGTH)?;
            hub.guild_master_change(gid, name).await;
        }
        0x301E => {
            let gid = rd.u32()?;
            hub.guild_force_save(gid).await;
        }

        0x3020 => {
            let req = CreateParty {
                account_id: rd.u32()?,
                char_id: rd.u32()?,
                lv: rd.u16()?,
                class: rd.u16()?,
                exp_share: rd.u8()?,
                item_share: rd.u8()?,
                name: rd.str_fixed(NAME_LENGTH)?,
                leader_name: rd.str_fixed(NAME_LENGTH)?,
            };
            hub.create_party(slot, req).await;
        }
        0x3021 => {
            let pid = rd.u32()?;
            let cid = rd.u32()?;
            hub.party_info(slot, pid, cid).await;
        }
        0x3022 => {
            let pid = rd.u32()?;
            let m = PartyMember {
                account_id: rd.u32()?,
                char_id: rd.u32()?,
                lv: rd.u16()?,
                class: rd.u16()?,
                name: rd.str_fixed(NAME_LENGTH)?,
                ..Default::default()
            };
            hub.party_add_member(slot, pid, m).await;
        }
        0x3023 => {
            let pid = rd.u32()?;
            let aid = rd.u32()?;
            let cid = rd.u32()?;
            hub.party_leave(pid, aid, cid).await;
        }
        0x3024 => {
            let pid = rd.u32()?;
            let aid = rd.u32()?;
            let cid = rd.u32()?;
            let online = rd.u8()? != 0;
            let lv = rd.u16()?;
            let zone = rd.u16()?;
            hub.party_member_moved(pid, aid, cid, online, lv, zone).await;
        }
        0x3025 => {
            let pid = rd.u32()?;
            let aid = rd.u32()?;
            let exp = rd.u8()?;
            let item = rd.u8()?;
            hub.party_change_option(pid, aid, exp, item).await;
        }
        0x3026 => {
            let pid = rd.u32()?;
            hub.break_party(pid).await;
        }
        cmd => return Err(DispatchError::UnknownCommand { link: MAPIF.link, cmd }),
    }
    Ok(())
}

pub async fn handle_map_server(state: Arc<CharState>, stream: TcpStream, prefix: [u8; 2]) {
    let conn_id = state.next_conn_id();
    let peer = stream.peer_addr().ok();
    let (mut rh, wh) = stream.into_split();
    let mut reader = FrameReader::with_prefix(&MAPIF, &prefix);

    let first = match reader.read_frame(&mut rh).await {
        Ok(Some(f)) => f,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("[char] [mapif] bad registration from {:?}: {}", peer, e);
            return;
        }
    };
    let Ok((id, pw, ip, port)) = parse_register(&first) else { return };

    let (tx, rx) = mpsc::channel(super::SEND_QUEUE);
    tokio::spawn(super::write_loop(wh, rx));

    let slot = {
        let mut hub = state.hub.lock().await;
        match hub.register(conn_id, tx.clone(), &id, &pw, ip, port) {
            Ok(slot) => {
                hub.send_to_slot(slot, register_ack(0, slot as u8));
                for pkt in hub.ranking_packets() {
                    hub.send_to_slot(slot, pkt);
                }
                slot
            }
            Err(e) => {
                tracing::warn!("[char] [mapif] registration from {:?} refused: {}", peer, e);
                let _ = tx.try_send(register_ack(e.code(), 0));
                return;
            }
        }
    };
    drop(tx);

    loop {
        let frame = match reader.read_frame(&mut rh).await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("[char] [mapif] map server #{}: {}", slot, e);
                break;
            }
        };
        let timers = {
            let mut hub = state.hub.lock().await;
            if hub.workers.conn_id(slot) != Some(conn_id) {
                break;
            }
            if let Err(e) = dispatch(&mut hub, slot, &frame).await {
                tracing::warn!("[char] [mapif] map server #{}: {}", slot, e);
                break;
            }
            hub.take_timers()
        };
        super::schedule(&state, timers);
    }

    let timers = {
        let mut hub = state.hub.lock().await;
        hub.worker_disconnected(slot, conn_id);
        hub.take_timers()
    };
    super::schedule(&state, timers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::char::charstatus::sample;
    use crate::servers::char::dispatch::FrameLen;
    use crate::servers::char::hub::tests::hub_with_worker;
    use tokio::sync::mpsc::Receiver;

    fn drain(rx: &mut Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut v = Vec::new();
        while let Ok(p) = rx.try_recv() {
            v.push(p);
        }
        v
    }

    #[test]
    fn test_length_table() {
        assert_eq!(MAPIF.lookup(0x3000), Some(FrameLen::Fixed(72)));
        assert_eq!(MAPIF.lookup(0x3003), Some(FrameLen::Fixed(35)));
        assert_eq!(MAPIF.lookup(0x3016), Some(FrameLen::Fixed(186)));
        assert_eq!(MAPIF.lookup(0x3017), Some(FrameLen::Variable));
        assert_eq!(MAPIF.lookup(0x3026), Some(FrameLen::Fixed(6)));
        assert_eq!(MAPIF.lookup(0x300B), None);
        assert_eq!(MAPIF.lookup(0x3027), None);
    }

    #[tokio::test]
    async fn test_keepalive_is_answered() {
        let (mut hub, mut rx) = hub_with_worker().await;
        dispatch(&mut hub, 0, &[0x09, 0x30]).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![0x0C, 0x38]);
    }

    #[tokio::test]
    async fn test_final_save_acks_and_goes_offline() {
        let (mut hub, mut rx) = hub_with_worker().await;
        hub.mark_online(0, 7, 42).await;
        drain(&mut rx);

        let mut rec = sample(7, 42);
        rec.vitals.zeny += 1;
        let pkt = PacketBuilder::variable(0x3004)
            .u32(42)
            .u32(7)
            .u8(1)
            .u8(0)
            .bytes(&rec.compress().unwrap())
            .finish();
        dispatch(&mut hub, 0, &pkt).await.unwrap();
        assert_eq!(drain(&mut rx).last().unwrap(), &vec![0x07, 0x38, 42, 0, 0, 0, 7, 0, 0, 0]);
        assert!(hub.online.get(42).is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let (mut hub, _rx) = hub_with_worker().await;
        let pkt = PacketBuilder::variable(0x3004).u32(42).u32(7).u8(0).u8(0).bytes(b"not zlib").finish();
        assert!(dispatch(&mut hub, 0, &pkt).await.is_err());
    }

    #[tokio::test]
    async fn test_short_frame_is_an_error() {
        let (mut hub, _rx) = hub_with_worker().await;
        assert!(matches!(
            dispatch(&mut hub, 0, &[0x05, 0x30, 1, 0]).await,
            Err(DispatchError::Short { cmd: 0x3005, .. })
        ));
    }

    #[tokio::test]
    async fn test_slot_offline_clears_its_characters() {
        let (mut hub, _rx) = hub_with_worker().await;
        hub.mark_online(0, 7, 42).await;
        hub.mark_online(0, 8, 43).await;
        dispatch(&mut hub, 0, &[0x07, 0x30]).await.unwrap();
        assert_eq!(hub.slot_population(0), 0);
        assert_eq!(hub.workers.users(0), 0);
    }

    #[tokio::test]
    async fn test_guild_create_over_the_wire() {
        let (mut hub, mut rx) = hub_with_worker().await;
        let pkt = PacketBuilder::new(0x3010)
            .u32(42)
            .u32(7)
            .u16(55)
            .u16(4)
            .str_fixed("Owls", NAME_LENGTH)
            .str_fixed("Hero7", NAME_LENGTH)
            .finish();
        assert_eq!(pkt.len(), 62);
        dispatch(&mut hub, 0, &pkt).await.unwrap();
        let reply = rx.try_recv().unwrap();
        assert_eq!(&reply[..6], &[0x10, 0x38, 42, 0, 0, 0]);
        assert_eq!(u32::from_le_bytes([reply[6], reply[7], reply[8], reply[9]]), 1);
        assert_eq!(hub.guilds.get(1).unwrap().name, "Owls");
    }

    #[tokio::test]
    async fn test_ranking_body_is_kept_whole() {
        let (mut hub, mut rx) = hub_with_worker().await;
        let pkt = PacketBuilder::variable(0x300A).u8(2).u8(0).finish();
        dispatch(&mut hub, 0, &pkt).await.unwrap();
        assert_eq!(hub.rankings.get(&2), Some(&vec![2, 0]));
        assert_eq!(rx.try_recv().unwrap(), vec![0x0D, 0x38, 8, 0, 0, 0, 2, 0]);
    }
}
