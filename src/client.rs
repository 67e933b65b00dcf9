//! Client: drives sync rounds over an established stream, optionally
//! staying resident to resynchronize on filesystem events.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::task;
use tracing::{debug, info, warn};

use crate::proto::{
    Handshake, HandshakeFlags, SrcFile, WireReader, WireWriter, ACK_OK, PROTOCOL_VERSION,
    WIRE_FORMAT_TYPED,
};
use crate::sender::{self, Sender, SenderSrcFile};
use crate::walk::SrcFileLister;
use crate::watch::{self, FsChange};

/// One client session: a handshaken stream plus the sender state for
/// the local tree. Rounds run through `&mut self`, so no two of them
/// can ever interleave on the stream.
pub struct SyncSession<S> {
    r: WireReader<ReadHalf<S>>,
    w: WireWriter<WriteHalf<S>>,
    sender: Sender,
    root: PathBuf,
    include_empty_dirs: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SyncSession<S> {
    /// Performs the handshake and returns a session ready for rounds.
    pub async fn start(
        stream: S,
        root: impl Into<PathBuf>,
        include_empty_dirs: bool,
    ) -> Result<Self> {
        let root = root.into();
        let (rd, wr) = tokio::io::split(stream);
        let mut w = WireWriter::new(wr);
        let hs = Handshake::new(PROTOCOL_VERSION, WIRE_FORMAT_TYPED, HandshakeFlags::empty());
        hs.write_to(&mut w).await?;
        w.flush().await?;
        Ok(Self {
            r: WireReader::new(rd),
            w,
            sender: Sender::new(root.clone()),
            root,
            include_empty_dirs,
        })
    }

    /// One full sync round over the current source tree.
    pub async fn sync_tree(&mut self, delete_extra: bool) -> Result<usize> {
        let root = self.root.clone();
        let include_empty_dirs = self.include_empty_dirs;
        let files = task::spawn_blocking(move || {
            SrcFileLister::new(root, include_empty_dirs).list()
        })
        .await
        .context("walk task panicked")??;
        self.sync(files, delete_extra).await
    }

    /// One sync round over an explicit set of entries. Returns how many
    /// of them the receiver reported changed.
    pub async fn sync(&mut self, files: Vec<SrcFile>, delete_extra: bool) -> Result<usize> {
        let mut list: Vec<SenderSrcFile> = files.into_iter().map(Into::into).collect();
        sender::send_src_file_list(&mut self.w, &list, delete_extra).await?;
        let nr_changed = sender::recv_dst_file_list(&mut self.r, &mut list).await?;
        if nr_changed == 0 {
            debug!("nothing has changed");
            return Ok(0);
        }
        debug!("{nr_changed} file(s) seem to have changed");
        self.sender.send_block_desc_list(&mut self.w, &mut list).await?;
        let ack = self.r.read_ack().await?;
        if ack != ACK_OK {
            bail!("receiver reported failure code {ack:#x}");
        }
        Ok(nr_changed)
    }

    /// Watches the source tree and resynchronizes after each coalesced
    /// burst of filesystem events. Runs until the watcher dies.
    pub async fn monitor(&mut self) -> Result<()> {
        let (_watcher, mut rx) = watch::watch_recursive(&self.root)?;
        info!("watching {} for changes", self.root.display());
        while let Some(batch) = watch::next_batch(&mut rx, watch::COALESCE_WINDOW).await {
            self.sync_batch(batch).await?;
        }
        Ok(())
    }

    async fn sync_batch(&mut self, batch: Vec<FsChange>) -> Result<()> {
        // a removal invalidates knowledge of the whole tree: resend the
        // full list and let the receiver delete what is gone
        if batch.iter().any(|c| matches!(c, FsChange::Removed(_))) {
            self.sync_tree(true).await?;
            return Ok(());
        }

        let root = self.root.clone();
        let include_empty_dirs = self.include_empty_dirs;
        let paths: Vec<PathBuf> = batch
            .into_iter()
            .filter_map(|c| match c {
                FsChange::Modified(p) | FsChange::Created(p) => Some(p),
                FsChange::Removed(_) => None,
            })
            .collect();

        let files = task::spawn_blocking(move || -> Result<Vec<SrcFile>> {
            let lister = SrcFileLister::new(root, include_empty_dirs);
            let mut files = Vec::new();
            let mut seen_paths = HashSet::new();
            for path in paths {
                if !seen_paths.insert(path.clone()) {
                    continue;
                }
                match std::fs::metadata(&path) {
                    Ok(meta) if meta.is_dir() => {
                        // a created directory brings its contents along
                        files.extend(lister.list_under(&path)?);
                    }
                    Ok(_) => lister.add_path(&mut files, &path)?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!("skipping vanished path {}", path.display());
                    }
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("failed to stat {}", path.display()))
                    }
                }
            }
            let mut seen_rel = HashSet::new();
            files.retain(|f| seen_rel.insert(f.path.clone()));
            Ok(files)
        })
        .await
        .context("walk task panicked")??;

        if files.is_empty() {
            return Ok(());
        }
        self.sync(files, false).await?;
        Ok(())
    }
}
