//! psyncd daemon: listens for clients and maintains the replica tree.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use psync::Server;
use tokio::net::{TcpListener, UnixListener};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:33333";
const DEFAULT_SOCKET: &str = "/tmp/psyncd.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Proto {
    Tcp4,
    Unix,
}

#[derive(Debug, Parser)]
#[command(name = "psyncd", about = "Replica daemon for psync clients")]
struct Args {
    /// Directory tree to maintain
    root: PathBuf,

    /// Listen address (host:port, or a socket path for --proto unix)
    #[arg(long, alias = "listenaddr", default_value = DEFAULT_ADDR)]
    addr: String,

    /// Listen protocol
    #[arg(long, value_enum, default_value = "tcp4")]
    proto: Proto,

    /// Chunk size for block signatures
    #[arg(long, default_value_t = 8)]
    blocksize: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };
    if args.blocksize == 0 {
        die(1, "blocksize must be positive");
    }

    let server = Server::new(&args.root, args.blocksize);
    let result = match args.proto {
        Proto::Tcp4 => match TcpListener::bind(args.addr.as_str()).await {
            Ok(listener) => server.run_tcp(listener).await,
            Err(e) => die(2, &format!("failed to listen on {}: {e}", args.addr)),
        },
        Proto::Unix => match bind_unix(&args.addr) {
            Ok(listener) => server.run_unix(listener).await,
            Err(e) => die(2, &format!("{e:#}")),
        },
    };
    if let Err(e) = result {
        die(3, &format!("{e:#}"));
    }
}

fn bind_unix(addr: &str) -> Result<UnixListener> {
    let path = if addr == DEFAULT_ADDR {
        PathBuf::from(DEFAULT_SOCKET)
    } else {
        PathBuf::from(addr)
    };
    // a previous daemon may have left the socket behind
    let _ = std::fs::remove_file(&path);
    UnixListener::bind(&path).with_context(|| format!("failed to listen on {}", path.display()))
}

fn die(code: i32, msg: &str) -> ! {
    eprintln!("psyncd: {msg}");
    process::exit(code)
}
