//! Sender-side orchestration: ships the source file list, ingests the
//! destination's verdicts and block signatures, then streams one delta
//! per changed file.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task;
use tracing::debug;

use crate::delta::{self, index_sums, SumIndex};
use crate::proto::{
    BlockSum, DstFile, DstFileType, FileListHdr, FileListType, RecordTag, SrcFile, WireReader,
    WireWriter,
};

/// One source entry plus the destination state learned for it during
/// the list exchange.
#[derive(Debug, Default)]
pub struct SenderSrcFile {
    pub src: SrcFile,
    pub dst: DstFile,
    pub sums: SumIndex,
}

impl From<SrcFile> for SenderSrcFile {
    fn from(src: SrcFile) -> Self {
        Self {
            src,
            dst: DstFile::default(),
            sums: SumIndex::new(),
        }
    }
}

/// Writes the sender file list header and entries, in list order.
pub async fn send_src_file_list<W: AsyncWrite + Unpin>(
    w: &mut WireWriter<W>,
    list: &[SenderSrcFile],
    delete_extra: bool,
) -> Result<()> {
    let hdr = FileListHdr {
        num_files: list.len() as u32,
        list_type: FileListType::Sender,
        delete_extra,
    };
    w.write_bytes(&hdr.encode())
        .await
        .context("sending src list header failed")?;
    for f in list {
        w.write_bytes(&f.src.encode())
            .await
            .context("sending src list failed")?;
    }
    w.flush().await
}

/// Reads the destination list that answers our source list, filling in
/// each entry's verdict and weak-hash signature index. Returns how many
/// entries are not identical, i.e. how many delta streams follow.
pub async fn recv_dst_file_list<R: AsyncRead + Unpin>(
    r: &mut WireReader<R>,
    list: &mut [SenderSrcFile],
) -> Result<usize> {
    let hdr = FileListHdr::decode(r.expect(RecordTag::FileListHdr).await?)
        .context("failed to recv dst header")?;
    if hdr.list_type != FileListType::Receiver {
        bail!("invalid dst list type: {:?}", hdr.list_type);
    }
    if hdr.num_files as usize != list.len() {
        bail!(
            "dst list length mismatch: got {}, want {}",
            hdr.num_files,
            list.len()
        );
    }
    let mut nr_changed = 0;
    for (i, f) in list.iter_mut().enumerate() {
        let dst = DstFile::decode(r.expect(RecordTag::DstFile).await?)
            .context("failed to recv dst list")?;
        if dst.id as usize != i {
            bail!("dst file invalid id: got {}, want {}", dst.id, i);
        }
        if dst.typ != DstFileType::Identical {
            nr_changed += 1;
        }
        let nr_blocks = dst.num_chunks();
        let mut sums = Vec::with_capacity(nr_blocks as usize);
        for _ in 0..nr_blocks {
            let bs = BlockSum::decode(r.expect(RecordTag::BlockSum).await?)
                .context("recving block sum failed")?;
            sums.push(bs);
        }
        f.dst = dst;
        f.sums = index_sums(sums);
    }
    Ok(nr_changed)
}

pub struct Sender {
    pub root: PathBuf,
}

impl Sender {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Streams a delta for every non-identical, non-directory entry.
    /// Generation is blocking (file reads plus hashing), so each file
    /// runs under `spawn_blocking`, feeding pre-encoded bytes through a
    /// channel that this task drains onto the wire.
    pub async fn send_block_desc_list<W: AsyncWrite + Unpin>(
        &self,
        w: &mut WireWriter<W>,
        list: &mut [SenderSrcFile],
    ) -> Result<()> {
        for (i, f) in list.iter_mut().enumerate() {
            if f.dst.typ == DstFileType::Identical || f.src.is_dir() {
                continue;
            }
            debug!("sending delta for {}", f.src.path);
            let path = self.root.join(&f.src.path);
            let id = i as u32;
            let size = f.src.size;
            let dst = f.dst;
            let sums = std::mem::take(&mut f.sums);

            let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
            let generate = task::spawn_blocking(move || -> Result<()> {
                let file = std::fs::File::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                let reader = std::io::BufReader::new(file);
                let emit = |b: Bytes| tx.send(b).map_err(|_| anyhow!("delta channel closed"));
                match dst.typ {
                    DstFileType::NotExist => delta::send_new_file(reader, id, size, emit),
                    DstFileType::Similar => {
                        delta::send_partial(reader, id, size, &dst, &sums, emit)
                    }
                    DstFileType::Identical => unreachable!("identical files are skipped"),
                }
            });

            while let Some(b) = rx.recv().await {
                w.write_bytes(&b).await?;
            }
            generate.await.context("delta task panicked")??;
        }
        w.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::BlockSum;

    fn src(path: &str, size: u64) -> SenderSrcFile {
        SenderSrcFile::from(SrcFile {
            path: path.to_string(),
            uid: 1000,
            gid: 1000,
            mode: 0o100644,
            size,
            mtime_sec: 1700000000,
            mtime_nsec: 0,
        })
    }

    #[tokio::test]
    async fn test_src_list_roundtrip_frames() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut w = WireWriter::new(a);
        let mut r = WireReader::new(b);

        let list = vec![src("path/to/file1.bin", 233348971), src("uboot.dtb", 4329918)];
        send_src_file_list(&mut w, &list, true).await.unwrap();

        let hdr = FileListHdr::decode(r.expect(RecordTag::FileListHdr).await.unwrap()).unwrap();
        assert_eq!(hdr.num_files, 2);
        assert_eq!(hdr.list_type, FileListType::Sender);
        assert!(hdr.delete_extra);
        for f in &list {
            let got = SrcFile::decode(r.expect(RecordTag::SrcFile).await.unwrap()).unwrap();
            assert_eq!(got, f.src);
        }
    }

    #[tokio::test]
    async fn test_recv_dst_list_builds_index() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut w = WireWriter::new(a);
        let mut r = WireReader::new(b);

        let hdr = FileListHdr {
            num_files: 3,
            list_type: FileListType::Receiver,
            delete_extra: false,
        };
        w.write_bytes(&hdr.encode()).await.unwrap();
        // similar file with two blocks, one of them a weak-hash duplicate
        w.write_bytes(
            &DstFile {
                id: 0,
                chunk_size: 8,
                size: 12,
                typ: DstFileType::Similar,
            }
            .encode(),
        )
        .await
        .unwrap();
        w.write_bytes(&BlockSum { rsum: 7, csum: [1; 16] }.encode()).await.unwrap();
        w.write_bytes(&BlockSum { rsum: 7, csum: [2; 16] }.encode()).await.unwrap();
        w.write_bytes(
            &DstFile {
                id: 1,
                chunk_size: 0,
                size: 0,
                typ: DstFileType::NotExist,
            }
            .encode(),
        )
        .await
        .unwrap();
        w.write_bytes(
            &DstFile {
                id: 2,
                chunk_size: 0,
                size: 0,
                typ: DstFileType::Identical,
            }
            .encode(),
        )
        .await
        .unwrap();
        w.flush().await.unwrap();

        let mut list = vec![src("a", 20), src("b", 9), src("c", 5)];
        let nr_changed = recv_dst_file_list(&mut r, &mut list).await.unwrap();
        assert_eq!(nr_changed, 2);
        assert_eq!(list[0].dst.typ, DstFileType::Similar);
        // duplicate weak hash collapsed to the first block
        assert_eq!(list[0].sums.len(), 1);
        assert_eq!(list[0].sums[&7].id, 0);
        assert_eq!(list[0].sums[&7].csum, [1; 16]);
        assert_eq!(list[1].dst.typ, DstFileType::NotExist);
        assert_eq!(list[2].dst.typ, DstFileType::Identical);
    }

    #[tokio::test]
    async fn test_recv_dst_list_rejects_bad_id() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut w = WireWriter::new(a);
        let mut r = WireReader::new(b);

        let hdr = FileListHdr {
            num_files: 1,
            list_type: FileListType::Receiver,
            delete_extra: false,
        };
        w.write_bytes(&hdr.encode()).await.unwrap();
        w.write_bytes(
            &DstFile {
                id: 5,
                chunk_size: 0,
                size: 0,
                typ: DstFileType::Identical,
            }
            .encode(),
        )
        .await
        .unwrap();
        w.flush().await.unwrap();

        let mut list = vec![src("a", 1)];
        let err = recv_dst_file_list(&mut r, &mut list).await.unwrap_err();
        assert!(err.to_string().contains("invalid id"));
    }

    #[tokio::test]
    async fn test_recv_dst_list_rejects_sender_type() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut w = WireWriter::new(a);
        let mut r = WireReader::new(b);

        let hdr = FileListHdr {
            num_files: 0,
            list_type: FileListType::Sender,
            delete_extra: false,
        };
        w.write_bytes(&hdr.encode()).await.unwrap();
        w.flush().await.unwrap();

        let mut list = vec![];
        assert!(recv_dst_file_list(&mut r, &mut list).await.is_err());
    }
}
