//! psync client: dials the daemon and pushes the local tree.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use psync::SyncSession;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:33333";
const DEFAULT_SOCKET: &str = "/tmp/psyncd.sock";
const DIAL_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Proto {
    Tcp4,
    Unix,
}

#[derive(Debug, Parser)]
#[command(name = "psync", about = "Synchronize a directory tree to a psyncd daemon")]
struct Args {
    /// Directory tree to synchronize from
    root: PathBuf,

    /// Daemon address (host:port, or a socket path for --proto unix)
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: String,

    /// Connection protocol
    #[arg(long, value_enum, default_value = "tcp4")]
    proto: Proto,

    /// Keep running and resynchronize on filesystem events
    #[arg(long)]
    mon: bool,

    /// Synchronize empty directories
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    allowemptydirs: bool,
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

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

    let stream = match dial(&args).await {
        Ok(stream) => stream,
        Err(e) => die(1, &format!("{e:#}")),
    };
    if let Err(e) = run(stream, &args).await {
        die(2, &format!("{e:#}"));
    }
}

async fn dial(args: &Args) -> Result<Box<dyn Stream>> {
    match args.proto {
        Proto::Tcp4 => {
            let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(args.addr.as_str()))
                .await
                .with_context(|| format!("failed to connect {}", args.addr))?
                .with_context(|| format!("failed to connect {}", args.addr))?;
            Ok(Box::new(stream))
        }
        Proto::Unix => {
            let path = if args.addr == DEFAULT_ADDR {
                DEFAULT_SOCKET
            } else {
                args.addr.as_str()
            };
            let stream = UnixStream::connect(path)
                .await
                .with_context(|| format!("failed to connect {path}"))?;
            Ok(Box::new(stream))
        }
    }
}

async fn run(stream: Box<dyn Stream>, args: &Args) -> Result<()> {
    let mut session = SyncSession::start(stream, &args.root, args.allowemptydirs).await?;
    session.sync_tree(true).await?;
    if args.mon {
        session.monitor().await?;
    }
    Ok(())
}

fn die(code: i32, msg: &str) -> ! {
    eprintln!("psync: {msg}");
    process::exit(code)
}
