//! Receiver-side orchestration: answers the source file list with
//! per-file verdicts and block signatures, then rebuilds each changed
//! file from its delta stream.
//!
//! Reconstruction never touches a destination file in place: content is
//! spliced into a temp file beside it and renamed over it only after
//! the whole-file checksum verifies.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use md5::{Digest, Md5};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::task;
use tracing::debug;
use walkdir::WalkDir;

use crate::delta::checksum::file_block_sums;
use crate::proto::{
    BlockType, DstFile, DstFileType, FileDesc, FileListHdr, FileListType, FileType, LocalBlock,
    RecordTag, RemoteBlock, SrcFile, WireReader, WireWriter,
};
use crate::temp::TempFileGuard;

/// One received source entry plus the destination state this side
/// derived for it while answering the list.
#[derive(Debug)]
pub struct ReceiverSrcFile {
    pub src: SrcFile,
    chunk_size: u32,
    dst_file_size: u64,
    dst_typ: DstFileType,
}

impl From<SrcFile> for ReceiverSrcFile {
    fn from(src: SrcFile) -> Self {
        Self {
            src,
            chunk_size: 0,
            dst_file_size: 0,
            dst_typ: DstFileType::Identical,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Receiver {
    pub root: PathBuf,
    /// Chunk size used when signing Similar files. This side decides it
    /// and the sender learns it from each DstFile record.
    pub block_size: u32,
}

impl Receiver {
    pub fn new(root: impl Into<PathBuf>, block_size: u32) -> Self {
        Self {
            root: root.into(),
            block_size,
        }
    }

    /// Resolves a wire-supplied relative path under the receiver root,
    /// rejecting anything that could escape it.
    fn full_path(&self, rel: &str) -> Result<PathBuf> {
        if rel.is_empty() {
            bail!("empty path in file list");
        }
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            bail!("absolute path in file list: {rel}");
        }
        for component in rel_path.components() {
            match component {
                Component::ParentDir => bail!("path traversal in file list: {rel}"),
                Component::Prefix(_) => bail!("prefix path in file list: {rel}"),
                _ => {}
            }
        }
        Ok(self.root.join(rel_path))
    }

    /// Reads one round's source file list. `None` means the peer closed
    /// the stream cleanly at the round boundary.
    pub async fn recv_src_file_list<R: AsyncRead + Unpin>(
        &self,
        r: &mut WireReader<R>,
    ) -> Result<Option<(Vec<ReceiverSrcFile>, bool)>> {
        let Some((tag, payload)) = r.try_read_frame().await? else {
            return Ok(None);
        };
        if tag != RecordTag::FileListHdr {
            bail!("unexpected record: got {tag:?}, want FileListHdr");
        }
        let hdr = FileListHdr::decode(payload).context("failed to recv src file list header")?;
        if hdr.list_type != FileListType::Sender {
            bail!("invalid src list type: {:?}", hdr.list_type);
        }
        let mut list = Vec::with_capacity(hdr.num_files as usize);
        for _ in 0..hdr.num_files {
            let src = SrcFile::decode(r.expect(RecordTag::SrcFile).await?)
                .context("recving src list failed")?;
            self.full_path(&src.path)?;
            list.push(ReceiverSrcFile::from(src));
        }
        Ok(Some((list, hdr.delete_extra)))
    }

    /// Removes every path under the root that the source list does not
    /// name. Directories go recursively; ancestors of listed paths are
    /// implicitly kept, and the root itself is never a candidate.
    pub async fn delete_extra(&self, list: &[ReceiverSrcFile]) -> Result<u64> {
        let root = self.root.clone();
        let mut keep: HashSet<PathBuf> = HashSet::new();
        for f in list {
            let mut p = PathBuf::from(&f.src.path);
            while !p.as_os_str().is_empty() {
                if !keep.insert(p.clone()) {
                    break;
                }
                p.pop();
            }
        }
        let deleted = task::spawn_blocking(move || -> Result<u64> {
            let mut deleted = 0;
            let mut it = WalkDir::new(&root).sort_by_file_name().into_iter();
            while let Some(entry) = it.next() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) if e.io_error().map(|io| io.kind())
                        == Some(std::io::ErrorKind::NotFound) =>
                    {
                        continue;
                    }
                    Err(e) => return Err(e).context("delete walk failed"),
                };
                if entry.depth() == 0 {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .context("walk escaped the root")?
                    .to_path_buf();
                if keep.contains(&rel) {
                    continue;
                }
                debug!("removing extraneous {}", rel.display());
                if entry.file_type().is_dir() {
                    std::fs::remove_dir_all(entry.path())
                        .with_context(|| format!("failed to remove {}", rel.display()))?;
                    it.skip_current_dir();
                } else {
                    std::fs::remove_file(entry.path())
                        .with_context(|| format!("failed to remove {}", rel.display()))?;
                }
                deleted += 1;
            }
            Ok(deleted)
        })
        .await
        .context("delete task panicked")??;
        Ok(deleted)
    }

    /// Pre-creates the directory entries of the list so child creates
    /// have their parents.
    pub async fn make_dirs(&self, list: &[ReceiverSrcFile]) -> Result<()> {
        for f in list {
            if !f.src.is_dir() {
                continue;
            }
            let full = self.full_path(&f.src.path)?;
            fs::create_dir_all(&full)
                .await
                .with_context(|| format!("failed to create directory {}", f.src.path))?;
        }
        Ok(())
    }

    /// Answers the source list: one DstFile verdict per entry, with
    /// block signatures following every Similar one. Returns the number
    /// of non-identical entries, i.e. how many delta streams to expect.
    pub async fn send_dst_file_list<W: AsyncWrite + Unpin>(
        &self,
        w: &mut WireWriter<W>,
        list: &mut [ReceiverSrcFile],
    ) -> Result<usize> {
        let hdr = FileListHdr {
            num_files: list.len() as u32,
            list_type: FileListType::Receiver,
            delete_extra: false,
        };
        w.write_bytes(&hdr.encode())
            .await
            .context("sending dst list header failed")?;

        let mut nr_changed = 0;
        for (i, f) in list.iter_mut().enumerate() {
            let id = i as u32;
            let full = self.full_path(&f.src.path)?;
            let meta = match fs::metadata(&full).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    w.write_bytes(
                        &DstFile {
                            id,
                            chunk_size: 0,
                            size: 0,
                            typ: DstFileType::NotExist,
                        }
                        .encode(),
                    )
                    .await?;
                    f.dst_typ = DstFileType::NotExist;
                    nr_changed += 1;
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to stat {}", f.src.path))
                }
                Ok(m) => m,
            };
            if meta.is_dir() != f.src.is_dir() {
                bail!(
                    "type mismatch for {}: directory on one side, regular file on the other",
                    f.src.path
                );
            }
            let same_stamp = meta.len() == f.src.size
                && FileTime::from_last_modification_time(&meta) == f.src.mtime();
            if f.src.is_dir() || same_stamp {
                w.write_bytes(
                    &DstFile {
                        id,
                        chunk_size: 0,
                        size: 0,
                        typ: DstFileType::Identical,
                    }
                    .encode(),
                )
                .await?;
                f.dst_typ = DstFileType::Identical;
                continue;
            }

            let dst = DstFile {
                id,
                chunk_size: self.block_size,
                size: meta.len(),
                typ: DstFileType::Similar,
            };
            w.write_bytes(&dst.encode()).await?;
            f.dst_typ = DstFileType::Similar;
            f.chunk_size = self.block_size;
            f.dst_file_size = meta.len();
            nr_changed += 1;

            let chunk_size = self.block_size as usize;
            let path = full.clone();
            let sums = task::spawn_blocking(move || file_block_sums(&path, chunk_size))
                .await
                .context("chunking task panicked")??;
            for s in &sums {
                w.write_bytes(&s.encode()).await?;
            }
        }
        w.flush().await?;
        Ok(nr_changed)
    }

    /// Consumes exactly `nr_changed` per-file delta streams.
    pub async fn build_files<R: AsyncRead + Unpin>(
        &self,
        r: &mut WireReader<R>,
        list: &[ReceiverSrcFile],
        nr_changed: usize,
    ) -> Result<()> {
        for _ in 0..nr_changed {
            self.build_file(r, list).await?;
        }
        Ok(())
    }

    async fn build_file<R: AsyncRead + Unpin>(
        &self,
        r: &mut WireReader<R>,
        list: &[ReceiverSrcFile],
    ) -> Result<()> {
        let fd = FileDesc::decode(r.expect(RecordTag::FileDesc).await?)?;
        let Some(f) = list.get(fd.id as usize) else {
            bail!("there is no such file with id {}", fd.id);
        };
        if f.dst_typ == DstFileType::Identical {
            bail!("unexpected delta stream for unchanged file {}", f.src.path);
        }
        debug!("rebuilding {} ({:?})", f.src.path, fd.typ);
        match fd.typ {
            FileType::NewFile => self.create_file(r, f, fd.total_size).await,
            FileType::PartialFile => self.rebuild_file(r, f).await,
        }
    }

    /// Materializes a NewFile stream: exactly `total_size` literal bytes
    /// into a temp file, committed by rename.
    async fn create_file<R: AsyncRead + Unpin>(
        &self,
        r: &mut WireReader<R>,
        f: &ReceiverSrcFile,
        total_size: u64,
    ) -> Result<()> {
        let full = self.full_path(&f.src.path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = full.with_extension("psync.tmp");
        let guard = TempFileGuard::new(&tmp_path);
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(f.src.perm())
            .open(&tmp_path)
            .await
            .with_context(|| format!("failed to create {}", f.src.path))?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut left = total_size;
        while left > 0 {
            let want = buf.len().min(left as usize);
            let n = r.read_raw(&mut buf[..want]).await?;
            if n == 0 {
                bail!(
                    "stream ended {} bytes short of new file {}",
                    left,
                    f.src.path
                );
            }
            tmp.write_all(&buf[..n]).await?;
            left -= n as u64;
        }
        tmp.flush().await?;
        drop(tmp);

        fs::rename(&tmp_path, &full).await?;
        guard.defuse();
        set_mtime(full, f.src.mtime()).await
    }

    /// Rebuilds a PartialFile stream by splicing copies from the old
    /// file with literal bytes from the wire, verifying the whole-file
    /// checksum before committing.
    async fn rebuild_file<R: AsyncRead + Unpin>(
        &self,
        r: &mut WireReader<R>,
        f: &ReceiverSrcFile,
    ) -> Result<()> {
        let full = self.full_path(&f.src.path)?;
        let tmp_path = full.with_extension("psync.tmp");
        let guard = TempFileGuard::new(&tmp_path);
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .with_context(|| format!("failed to create temp for {}", f.src.path))?;
        let mut old = File::open(&full)
            .await
            .with_context(|| format!("failed to open existing {}", f.src.path))?;

        self.merge(r, f, &mut old, &mut tmp).await?;

        tmp.flush().await?;
        drop(tmp);
        drop(old);
        fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(f.src.perm())).await?;
        fs::rename(&tmp_path, &full).await?;
        guard.defuse();
        set_mtime(full, f.src.mtime()).await
    }

    async fn merge<R: AsyncRead + Unpin>(
        &self,
        r: &mut WireReader<R>,
        f: &ReceiverSrcFile,
        old: &mut File,
        tmp: &mut File,
    ) -> Result<()> {
        let chunk_size = f.chunk_size as u64;
        if chunk_size == 0 {
            bail!("partial rebuild of {} with zero chunk size", f.src.path);
        }
        let size = f.src.size;
        let mut hasher = Md5::new();
        let mut off = 0u64;
        let mut buf = vec![0u8; 64 * 1024];

        while off < size {
            let typ = BlockType::decode(r.expect(RecordTag::BlockType).await?)?;
            match typ {
                BlockType::Local => {
                    let lb = LocalBlock::decode(r.expect(RecordTag::LocalBlock).await?)?;
                    if lb.off != off {
                        bail!("local bad file offset: want {}, got {}", lb.off, off);
                    }
                    if off + lb.size > size {
                        bail!("literal block overruns the declared size");
                    }
                    let mut left = lb.size;
                    while left > 0 {
                        let want = buf.len().min(left as usize);
                        r.read_raw_exact(&mut buf[..want]).await?;
                        hasher.update(&buf[..want]);
                        tmp.write_all(&buf[..want]).await?;
                        left -= want as u64;
                    }
                    off += lb.size;
                }
                BlockType::Remote => {
                    let rb = RemoteBlock::decode(r.expect(RecordTag::RemoteBlock).await?)?;
                    if rb.off != off {
                        bail!("remote bad file offset: want {}, got {}", rb.off, off);
                    }
                    if rb.nr_chunks == 0 {
                        bail!("empty copy block");
                    }
                    let start = rb.chunk_id as u64 * chunk_size;
                    if start >= f.dst_file_size {
                        bail!("copy block starts outside the old file");
                    }
                    // a run ending in the old file's final chunk copies
                    // that chunk's true, shorter length
                    let want_total =
                        (rb.nr_chunks as u64 * chunk_size).min(f.dst_file_size - start);
                    if off + want_total > size {
                        bail!("copy block overruns the declared size");
                    }
                    old.seek(SeekFrom::Start(start)).await?;
                    let mut left = want_total;
                    while left > 0 {
                        let want = buf.len().min(left as usize);
                        old.read_exact(&mut buf[..want])
                            .await
                            .context("old file shorter than its signatures")?;
                        hasher.update(&buf[..want]);
                        tmp.write_all(&buf[..want]).await?;
                        left -= want as u64;
                    }
                    off += want_total;
                }
                BlockType::FileSum => {
                    bail!("file checksum arrived before the stream covered the file");
                }
            }
        }

        let typ = BlockType::decode(r.expect(RecordTag::BlockType).await?)?;
        if typ != BlockType::FileSum {
            bail!("unexpected block type: {typ:?}, want FileSum");
        }
        let mut want_sum = [0u8; 16];
        r.read_raw_exact(&mut want_sum).await?;
        let got: [u8; 16] = hasher.finalize().into();
        if got != want_sum {
            bail!("checksum of rebuilt {} does not match the source", f.src.path);
        }
        Ok(())
    }
}

async fn set_mtime(path: PathBuf, mtime: FileTime) -> Result<()> {
    task::spawn_blocking(move || filetime::set_file_mtime(&path, mtime))
        .await
        .context("mtime task panicked")?
        .context("failed to set mtime")?;
    Ok(())
}
