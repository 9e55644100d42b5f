//! Localhost demo: a plain TCP echo peer on one side, the fabric on the
//! other. Traffic crosses the channels, the proxy owns the only real
//! client-side socket.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};

use clap::Parser;
use log::{error, info};

use shunt::{establish, FabricConfig};

#[derive(Parser)]
#[command(name = "shunt-demo", about = "Socket fabric echo demo")]
struct Args {
    /// Host worker threads.
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Echo round trips.
    #[arg(long, default_value_t = 4)]
    rounds: usize,
    /// Pin workers to cores.
    #[arg(long, default_value_t = false)]
    pin: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("demo failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = match listener.local_addr()? {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => unreachable!(),
    };
    info!("echo peer on {}", addr);
    std::thread::spawn(move || {
        if let Ok((mut conn, _)) = listener.accept() {
            let mut buf = [0u8; 4096];
            while let Ok(n) = conn.read(&mut buf) {
                if n == 0 || conn.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    });

    let cfg = FabricConfig::builder()
        .workers(args.workers)
        .pin_workers(args.pin)
        .build();
    let (links, proxy) = establish(cfg)?;
    let link = &links[0];

    let sock = link.socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
    sock.connect(addr)?;
    info!("connected through the fabric");

    let mut buf = [0u8; 64];
    for round in 0..args.rounds {
        let msg = format!("round {} through the fabric", round);
        sock.send(msg.as_bytes())?;
        let mut got = 0;
        while got < msg.len() {
            got += sock.recv(&mut buf[got..msg.len()])?;
        }
        info!("echoed: {}", std::str::from_utf8(&buf[..got])?);
    }

    sock.close()?;
    drop(links);
    proxy.shutdown();
    Ok(())
}
