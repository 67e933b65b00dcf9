//! Delta engine: scans a source file against the destination's block
//! signatures and emits a stream of remote/local block descriptors.
//!
//! The scanner rolls a weak hash byte-by-byte over the source. A weak
//! hit is confirmed with MD5 before a block is declared matched. Runs of
//! consecutive matched chunks coalesce into a single RemoteBlock; bytes
//! between matches leave as LocalBlock literals. Everything is emitted
//! as pre-encoded wire bytes through a caller-supplied sink, so the
//! engine runs against in-memory readers in tests and against files
//! under `spawn_blocking` in production.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use md5::{Digest, Md5};
use tracing::trace;

use crate::delta::rolling::Adler32;
use crate::delta::window::Bring;
use crate::proto::{BlockSum, BlockType, DstFile, FileDesc, FileType, LocalBlock, RemoteBlock};

/// Sender-side view of one destination block: its chunk ordinal and
/// strong hash, reachable through the weak hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedSum {
    pub id: u32,
    pub csum: [u8; 16],
}

/// Weak-hash index over a destination file's block signatures.
pub type SumIndex = HashMap<u32, IndexedSum>;

/// Indexes block signatures by weak hash. Colliding weak hashes keep the
/// first block; later duplicates are dropped.
pub fn index_sums<I: IntoIterator<Item = BlockSum>>(sums: I) -> SumIndex {
    let mut index = SumIndex::new();
    for (id, bs) in sums.into_iter().enumerate() {
        index.entry(bs.rsum).or_insert(IndexedSum {
            id: id as u32,
            csum: bs.csum,
        });
    }
    index
}

/// Raised when the declared source size is exhausted but more bytes want
/// out. The scan stops and the stream is finalized at exactly the
/// declared size.
#[derive(Debug)]
struct NoSpaceLeft;

impl fmt::Display for NoSpaceLeft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("block encoder: no space left")
    }
}

impl std::error::Error for NoSpaceLeft {}

/// Tees bytes into an MD5 context as they are read, producing the
/// whole-file digest for the FileSum trailer.
struct HashingReader<R> {
    inner: R,
    digest: Md5,
}

impl<R> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            digest: Md5::new(),
        }
    }

    fn sum(&self) -> [u8; 16] {
        self.digest.clone().finalize().into()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

/// Streams a whole source file as one NewFile delta stream.
pub fn send_new_file<R, F>(mut r: R, id: u32, size: u64, mut emit: F) -> Result<()>
where
    R: Read,
    F: FnMut(Bytes) -> Result<()>,
{
    emit(FileDesc {
        id,
        typ: FileType::NewFile,
        total_size: size,
    }
    .encode())?;

    let mut left = size;
    let mut buf = vec![0u8; 64 * 1024];
    while left > 0 {
        let want = buf.len().min(left as usize);
        let n = r.read(&mut buf[..want]).context("read failed")?;
        if n == 0 {
            bail!("source file shorter than listed: {left} bytes missing");
        }
        emit(Bytes::copy_from_slice(&buf[..n]))?;
        left -= n as u64;
    }
    Ok(())
}

/// Streams one changed file as a PartialFile delta against the
/// destination state in `dst`/`sums`, closed by the whole-file MD5.
pub fn send_partial<R, F>(
    r: R,
    id: u32,
    src_size: u64,
    dst: &DstFile,
    sums: &SumIndex,
    mut emit: F,
) -> Result<()>
where
    R: Read,
    F: FnMut(Bytes) -> Result<()>,
{
    let chunk_size = dst.chunk_size as usize;
    if chunk_size == 0 {
        bail!("partial transfer with zero chunk size");
    }
    emit(FileDesc {
        id,
        typ: FileType::PartialFile,
        total_size: src_size,
    }
    .encode())?;

    let mut win = Bring::new(HashingReader::new(r), chunk_size);
    let mut enc = BlockEncoder {
        emit: &mut emit,
        block_size: dst.chunk_size as u64,
        off: 0,
        remainder: src_size,
        last_block_id: dst.last_chunk_id(),
        last_block_size: dst.last_chunk_size(),
        run: None,
    };

    if let Err(e) = scan(&mut enc, &mut win, sums, chunk_size) {
        if e.downcast_ref::<NoSpaceLeft>().is_none() {
            return Err(e);
        }
        enc.flush_reuse_chunks()?;
    }

    let digest = win.get_mut().sum();
    emit(BlockType::FileSum.encode())?;
    emit(Bytes::copy_from_slice(&digest))?;
    Ok(())
}

/// The scanning loop: fill a window, test it, roll byte-by-byte on a
/// miss, dump the head as a literal when a whole window rolls through
/// without matching.
fn scan<R, F>(
    enc: &mut BlockEncoder<'_, F>,
    win: &mut Bring<HashingReader<R>>,
    sums: &SumIndex,
    chunk_size: usize,
) -> Result<()>
where
    R: Read,
    F: FnMut(Bytes) -> Result<()>,
{
    let mut rh = Adler32::new();
    'outer: loop {
        let start = win.buffered_len();
        let n = win.fill(chunk_size).context("read failed")?;
        if n == 0 {
            break;
        }
        rh.reset();
        rh.update(&win.buffered()[start..]);

        if let Some(hit) = confirm(sums, rh.sum32(), win.tail()) {
            if win.head_len() > 0 {
                enc.send_local_block(win)?;
            }
            enc.send_remote_block(win, hit)?;
            continue;
        }

        for _ in 0..chunk_size {
            let Some((inn, out)) = win.read_byte().context("read failed")? else {
                break 'outer;
            };
            rh.roll(out, inn);
            let Some(hit) = confirm(sums, rh.sum32(), win.tail()) else {
                continue;
            };
            if win.head_len() > 0 {
                enc.send_local_block(win)?;
            }
            enc.send_remote_block(win, hit)?;
            continue 'outer;
        }

        // a whole window rolled through without a match
        enc.send_local_block(win)?;
    }

    match enc.flush(win) {
        Err(e) if e.downcast_ref::<NoSpaceLeft>().is_some() => Ok(()),
        other => other,
    }
}

/// Confirms a weak-hash hit with the strong hash of the current window.
fn confirm(sums: &SumIndex, rsum: u32, tail: &[u8]) -> Option<u32> {
    let hit = sums.get(&rsum)?;
    if <[u8; 16]>::from(Md5::digest(tail)) == hit.csum {
        Some(hit.id)
    } else {
        None
    }
}

/// An in-progress run of consecutive matched chunks.
struct Run {
    first_id: u32,
    prev_id: u32,
    bytes: u64,
}

/// Emits block descriptors, coalescing consecutive remote chunks and
/// keeping the byte accounting exact: `remainder` counts the bytes still
/// owed to the output, and every emission is clamped to it.
struct BlockEncoder<'a, F> {
    emit: &'a mut F,
    block_size: u64,
    off: u64,
    remainder: u64,
    last_block_id: u32,
    last_block_size: u64,
    run: Option<Run>,
}

impl<F: FnMut(Bytes) -> Result<()>> BlockEncoder<'_, F> {
    /// Byte contribution of chunk `id`, clamped to the remainder. The
    /// destination's final chunk contributes its true, shorter size.
    fn remote_block_size(&self, id: u32) -> u64 {
        if self.remainder == 0 {
            return 0;
        }
        if id == self.last_block_id {
            self.last_block_size.min(self.remainder)
        } else {
            self.block_size.min(self.remainder)
        }
    }

    fn local_block_size(&self, n: u64) -> u64 {
        n.min(self.remainder)
    }

    /// Drains the head region as one literal block.
    fn send_local_block<R: Read>(&mut self, win: &mut Bring<R>) -> Result<()> {
        if self.run.is_some() {
            self.flush_reuse_chunks()?;
        }
        let hlen = self.local_block_size(win.head_len() as u64);
        if hlen == 0 {
            return Err(NoSpaceLeft.into());
        }
        (self.emit)(BlockType::Local.encode())?;
        (self.emit)(
            LocalBlock {
                size: hlen,
                off: self.off,
            }
            .encode(),
        )?;
        let data = win.take_head(hlen as usize);
        trace!("local block: size {}, off {}", hlen, self.off);
        self.off += hlen;
        self.remainder -= hlen;
        (self.emit)(data)?;
        Ok(())
    }

    /// Accounts a matched chunk, extending the current run when the id
    /// is consecutive and flushing it otherwise.
    fn send_remote_block<R: Read>(&mut self, win: &mut Bring<R>, id: u32) -> Result<()> {
        let bsize = self.remote_block_size(id);
        if bsize == 0 {
            if self.run.is_some() {
                return self.flush_reuse_chunks();
            }
            return Err(NoSpaceLeft.into());
        }
        win.skip(bsize as usize);
        self.remainder -= bsize;
        trace!("matched chunk {}: {} bytes, {} left", id, bsize, self.remainder);
        match &mut self.run {
            Some(run) if id == run.prev_id + 1 => {
                run.prev_id = id;
                run.bytes += bsize;
            }
            Some(_) => {
                self.flush_reuse_chunks()?;
                self.run = Some(Run {
                    first_id: id,
                    prev_id: id,
                    bytes: bsize,
                });
            }
            None => {
                self.run = Some(Run {
                    first_id: id,
                    prev_id: id,
                    bytes: bsize,
                });
            }
        }
        Ok(())
    }

    /// Emits the pending coalesced run, if any.
    fn flush_reuse_chunks(&mut self) -> Result<()> {
        let Some(run) = self.run.take() else {
            return Ok(());
        };
        let nr_chunks = run.prev_id - run.first_id + 1;
        trace!(
            "remote block: chunks {}..={}, off {}",
            run.first_id,
            run.prev_id,
            self.off
        );
        (self.emit)(BlockType::Remote.encode())?;
        (self.emit)(
            RemoteBlock {
                chunk_id: run.first_id,
                nr_chunks,
                off: self.off,
            }
            .encode(),
        )?;
        self.off += run.bytes;
        Ok(())
    }

    /// End of scan: emit the pending run, then whatever is still
    /// buffered (a tail shorter than the window) as a final literal.
    fn flush<R: Read>(&mut self, win: &mut Bring<R>) -> Result<()> {
        self.flush_reuse_chunks()?;
        let buffered = win.buffered_len() as u64;
        if buffered == 0 {
            return Ok(());
        }
        let blen = self.local_block_size(buffered);
        if blen == 0 {
            return Err(NoSpaceLeft.into());
        }
        (self.emit)(BlockType::Local.encode())?;
        (self.emit)(
            LocalBlock {
                size: blen,
                off: self.off,
            }
            .encode(),
        )?;
        let data = win.take_buffered(blen as usize);
        trace!("flush local block: size {}, off {}", blen, self.off);
        self.off += blen;
        self.remainder -= blen;
        (self.emit)(data)?;
        Ok(())
    }
}
