use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use charhub::config::ServerConfig;
use charhub::servers::char::db::MemoryStore;
use charhub::servers::char::CharState;

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(CharState::new(Arc::new(MemoryStore::new()), ServerConfig::test_only()));
    CharState::start(&state).await;

    tokio::spawn(async move {
        let _ = CharState::run(state, listener).await;
    });

    addr
}

fn fixed(s: &str, len: usize) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.resize(len, 0);
    v
}

fn register_packet(id: &str, pw: &str, port: u16) -> Vec<u8> {
    let mut p = vec![0x00, 0x30];
    p.extend(fixed(id, 32));
    p.extend(fixed(pw, 32));
    p.extend(u32::from(Ipv4Addr::new(127, 0, 0, 1)).to_le_bytes());
    p.extend(port.to_le_bytes());
    assert_eq!(p.len(), 72);
    p
}

fn zones_packet(zones: &[u16]) -> Vec<u8> {
    let mut p = vec![0x01, 0x30, 0, 0, 0, 0];
    p.extend((zones.len() as u16).to_le_bytes());
    for z in zones {
        p.extend(z.to_le_bytes());
    }
    let len = p.len() as u32;
    p[2..6].copy_from_slice(&len.to_le_bytes());
    p
}

async fn read_n(s: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(5), s.read_exact(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .unwrap();
    buf
}

async fn expect_eof(s: &mut TcpStream) {
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), s.read_to_end(&mut rest))
        .await
        .expect("connection left open")
        .unwrap_or(0);
    assert_eq!(n, 0, "unexpected trailing bytes: {:?}", rest);
}

async fn register_map(addr: SocketAddr, port: u16) -> TcpStream {
    let mut s = TcpStream::connect(addr).await.unwrap();
    s.write_all(&register_packet("mapid", "mappw", port)).await.unwrap();
    let ack = read_n(&mut s, 4).await;
    assert_eq!(&ack[..3], &[0x00, 0x38, 0x00], "registration refused: {:?}", ack);
    s
}

/// Round-trips a keepalive so every frame sent before it has been handled.
async fn sync(s: &mut TcpStream) {
    s.write_all(&[0x09, 0x30]).await.unwrap();
    assert_eq!(read_n(s, 2).await, vec![0x0C, 0x38]);
}

#[tokio::test]
async fn test_map_server_register_and_keepalive() {
    let addr = start_test_server().await;
    let mut map = TcpStream::connect(addr).await.unwrap();
    map.write_all(&register_packet("mapid", "mappw", 5121)).await.unwrap();
    assert_eq!(read_n(&mut map, 4).await, vec![0x00, 0x38, 0x00, 0x00]);

    sync(&mut map).await;
}

#[tokio::test]
async fn test_map_server_bad_credentials_rejected() {
    let addr = start_test_server().await;
    let mut map = TcpStream::connect(addr).await.unwrap();
    map.write_all(&register_packet("mapid", "wrong", 5121)).await.unwrap();
    assert_eq!(read_n(&mut map, 4).await, vec![0x00, 0x38, 0x01, 0x00]);
    expect_eof(&mut map).await;
}

#[tokio::test]
async fn test_slots_exhausted() {
    let addr = start_test_server().await;
    let _a = register_map(addr, 5121).await;
    let _b = register_map(addr, 5122).await;

    let mut c = TcpStream::connect(addr).await.unwrap();
    c.write_all(&register_packet("mapid", "mappw", 5123)).await.unwrap();
    assert_eq!(read_n(&mut c, 4).await, vec![0x00, 0x38, 0x03, 0x00]);
}

#[tokio::test]
async fn test_zone_lists_are_exchanged() {
    let addr = start_test_server().await;
    let ip = u32::from(Ipv4Addr::new(127, 0, 0, 1)).to_le_bytes();

    let mut a = register_map(addr, 5121).await;
    a.write_all(&zones_packet(&[1, 2])).await.unwrap();
    sync(&mut a).await;

    let mut b = register_map(addr, 5122).await;
    b.write_all(&zones_packet(&[3])).await.unwrap();

    // a learns b's zone
    let got = read_n(&mut a, 16).await;
    assert_eq!(&got[..2], &[0x01, 0x38]);
    assert_eq!(u32::from_le_bytes([got[2], got[3], got[4], got[5]]), 16);
    assert_eq!(&got[6..10], &ip);
    assert_eq!(u16::from_le_bytes([got[10], got[11]]), 5122);
    assert_eq!(u16::from_le_bytes([got[12], got[13]]), 1);
    assert_eq!(u16::from_le_bytes([got[14], got[15]]), 3);

    // b learns a's zones
    let got = read_n(&mut b, 18).await;
    assert_eq!(&got[..2], &[0x01, 0x38]);
    assert_eq!(u16::from_le_bytes([got[10], got[11]]), 5121);
    assert_eq!(u16::from_le_bytes([got[12], got[13]]), 2);
    assert_eq!(u16::from_le_bytes([got[14], got[15]]), 1);
    assert_eq!(u16::from_le_bytes([got[16], got[17]]), 2);
}

#[tokio::test]
async fn test_client_refused_without_login_server() {
    let addr = start_test_server().await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let mut enter = vec![0x65, 0x00];
    enter.extend(2_000_000u32.to_le_bytes());
    enter.extend(111u32.to_le_bytes());
    enter.extend(222u32.to_le_bytes());
    enter.extend([0u8, 0]);
    enter.push(1);
    assert_eq!(enter.len(), 17);
    client.write_all(&enter).await.unwrap();

    assert_eq!(read_n(&mut client, 3).await, vec![0x6C, 0x00, 0x00]);
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn test_unknown_first_packet_is_dropped() {
    let addr = start_test_server().await;
    let mut s = TcpStream::connect(addr).await.unwrap();
    s.write_all(&[0x34, 0x12, 0, 0]).await.unwrap();
    expect_eof(&mut s).await;
}
