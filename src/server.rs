//! Daemon: accepts connections and serves sync sessions.
//!
//! One accepted connection is one session. Each session is handled
//! serially in its own task; within it the daemon loops serving sync
//! rounds until the client closes the stream. Session errors close that
//! connection and accepting continues.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::proto::{Handshake, WireReader, WireWriter, ACK_OK, PROTOCOL_VERSION, WIRE_FORMAT_TYPED};
use crate::receiver::Receiver;

/// Bounds how long a misconnected client can hold a slot before saying
/// anything. Only the handshake read is guarded; sync rounds are not.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct Server {
    pub root: PathBuf,
    pub block_size: u32,
}

impl Server {
    pub fn new(root: impl Into<PathBuf>, block_size: u32) -> Self {
        Self {
            root: root.into(),
            block_size,
        }
    }

    pub async fn run_tcp(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("failed to accept")?;
            debug!("accepted connection from {peer}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream).await {
                    warn!("session failed: {e:#}");
                }
            });
        }
    }

    pub async fn run_unix(&self, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await.context("failed to accept")?;
            debug!("accepted unix connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream).await {
                    warn!("session failed: {e:#}");
                }
            });
        }
    }

    /// Serves one session on an established stream: handshake, then
    /// sync rounds until the peer closes.
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (rd, wr) = tokio::io::split(stream);
        let mut r = WireReader::new(rd);
        let mut w = WireWriter::new(wr);

        let hs = timeout(HANDSHAKE_TIMEOUT, Handshake::read_from(&mut r))
            .await
            .context("handshake timed out")??;
        if hs.version != PROTOCOL_VERSION {
            bail!(
                "protocol version mismatch: got {}, want {}",
                hs.version,
                PROTOCOL_VERSION
            );
        }
        if hs.wire_format != WIRE_FORMAT_TYPED {
            bail!("unsupported wire format {}", hs.wire_format);
        }

        let recv = Receiver::new(&self.root, self.block_size);
        loop {
            let Some((mut list, delete_extra)) = recv.recv_src_file_list(&mut r).await? else {
                debug!("peer closed the session");
                return Ok(());
            };
            if delete_extra {
                let deleted = recv.delete_extra(&list).await?;
                if deleted > 0 {
                    debug!("removed {deleted} extraneous entries");
                }
            }
            recv.make_dirs(&list).await?;
            let nr_changed = recv.send_dst_file_list(&mut w, &mut list).await?;
            if nr_changed == 0 {
                debug!("nothing has changed");
                continue;
            }
            debug!("{nr_changed} file(s) seem to have changed");
            recv.build_files(&mut r, &list, nr_changed).await?;
            w.write_ack(ACK_OK).await?;
            w.flush().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::HandshakeFlags;

    #[tokio::test]
    async fn test_serve_rejects_bad_magic() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let srv = Server::new("/nonexistent", 8);
        let serve = tokio::spawn(async move { srv.serve(server).await });

        let mut w = WireWriter::new(client);
        w.write_raw(b"nope....").await.unwrap();
        w.flush().await.unwrap();

        let err = serve.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[tokio::test]
    async fn test_serve_rejects_version_mismatch() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let srv = Server::new("/nonexistent", 8);
        let serve = tokio::spawn(async move { srv.serve(server).await });

        let hs = Handshake::new(99, WIRE_FORMAT_TYPED, HandshakeFlags::empty());
        let mut w = WireWriter::new(client);
        w.write_raw(&hs.encode()).await.unwrap();
        w.flush().await.unwrap();

        let err = serve.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("version mismatch"));
    }

    #[tokio::test]
    async fn test_serve_times_out_silent_client() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let srv = Server::new("/nonexistent", 8);
        let serve = tokio::spawn(async move { srv.serve(server).await });

        // say nothing; the handshake deadline should fire
        let err = serve.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("timed out"));
        drop(client);
    }

    #[tokio::test]
    async fn test_serve_ends_on_clean_close_after_handshake() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let srv = Server::new("/nonexistent", 8);
        let serve = tokio::spawn(async move { srv.serve(server).await });

        let hs = Handshake::new(PROTOCOL_VERSION, WIRE_FORMAT_TYPED, HandshakeFlags::empty());
        let mut w = WireWriter::new(client);
        w.write_raw(&hs.encode()).await.unwrap();
        w.flush().await.unwrap();
        drop(w);

        serve.await.unwrap().unwrap();
    }
}
