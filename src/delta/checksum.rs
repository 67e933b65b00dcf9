//! Block-signature producer: chunks an existing destination file into
//! fixed-size blocks and computes the weak + strong signature of each.
//!
//! The final block may be shorter than the chunk size; its true length
//! is implied by the file size already reported in the DstFile record.

use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};
use md5::{Digest, Md5};

use crate::delta::rolling::Adler32;
use crate::proto::BlockSum;

/// Computes one BlockSum per `chunk_size` block of `r`, in order.
pub fn block_sums<R: Read>(mut r: R, chunk_size: usize) -> Result<Vec<BlockSum>> {
    assert!(chunk_size > 0, "chunk size must be positive");
    let mut sums = Vec::new();
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = read_block(&mut r, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        let mut weak = Adler32::new();
        weak.update(block);
        sums.push(BlockSum {
            rsum: weak.sum32(),
            csum: Md5::digest(block).into(),
        });
        if n < chunk_size {
            break;
        }
    }
    Ok(sums)
}

/// Like [`block_sums`], reading from a file on disk.
pub fn file_block_sums(path: &Path, chunk_size: usize) -> Result<Vec<BlockSum>> {
    let f = std::fs::File::open(path)
        .with_context(|| format!("failed to open {} for chunking", path.display()))?;
    block_sums(io::BufReader::new(f), chunk_size)
}

fn read_block<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read failed while chunking"),
        }
    }
    Ok(n)
}
