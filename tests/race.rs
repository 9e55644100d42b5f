//! Teardown races: sockets closing while the host is still pushing data
//! events at them. Deliveries for a closing tag must be dropped, never
//! delivered to freed state, and the link must stay usable.

use std::io::Write;
use std::net::{SocketAddr, SocketAddrV4, TcpListener};
use std::time::Duration;

use shunt::{establish, FabricConfig};

/// Peer that floods every connection with data and drops it.
fn flood_server(bytes: usize) -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = match listener.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => unreachable!(),
    };
    std::thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            std::thread::spawn(move || {
                let chunk = vec![0xabu8; 4096];
                let mut left = bytes;
                while left > 0 {
                    let n = chunk.len().min(left);
                    if conn.write_all(&chunk[..n]).is_err() {
                        break;
                    }
                    left -= n;
                }
            });
        }
    });
    addr
}

#[test]
fn test_close_races_inbound_events() {
    let addr = flood_server(100 * 1024);
    let cfg = FabricConfig::builder().channel_slots(8).build();
    let (links, _proxy) = establish(cfg).unwrap();
    let link = &links[0];

    for round in 0..30u64 {
        let sock = link.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        sock.connect(addr).unwrap();
        // Stagger the close against the incoming flood.
        if round % 3 == 0 {
            std::thread::sleep(Duration::from_millis(round % 7));
        }
        if round % 2 == 0 {
            let mut buf = [0u8; 512];
            let _ = sock.recv(&mut buf);
        }
        sock.close().unwrap();
    }

    // The link survived every teardown: a fresh socket still works.
    let sock = link.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    sock.connect(addr).unwrap();
    let mut buf = [0u8; 512];
    assert!(sock.recv(&mut buf).unwrap() > 0);
    sock.close().unwrap();
}
