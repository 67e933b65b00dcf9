//! Wire protocol: handshake, typed records, framing.
//!
//! All multi-byte integers are big-endian. After the 8-byte handshake,
//! every structured record travels as a self-describing frame
//! (`len:u32 | tag:u8 | payload`). Literal file content, local-block
//! payloads and whole-file digests are written as raw bytes between
//! frames, so the read side must be buffered.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// Protocol magic, first four bytes on the wire.
pub const MAGIC: [u8; 4] = *b"psyn";

/// Protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Wire format tag: self-describing typed frames (the only format defined).
pub const WIRE_FORMAT_TYPED: u8 = 0;

/// Maximum frame payload (16MB) - bounds allocation on a hostile peer.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Acknowledgement value for a successfully completed sync round.
pub const ACK_OK: u32 = 0;

bitflags::bitflags! {
    /// Handshake feature bits. Bit 0 is reserved for gzip compression,
    /// which the protocol reserves but does not implement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandshakeFlags: u8 {
        const GZIP = 1 << 0;
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// The fixed 8-byte session preamble: magic, version, wire format, flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub version: u16,
    pub wire_format: u8,
    pub flags: HandshakeFlags,
}

impl Handshake {
    pub fn new(version: u16, wire_format: u8, flags: HandshakeFlags) -> Self {
        Self {
            version,
            wire_format,
            flags,
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6] = self.wire_format;
        buf[7] = self.flags.bits();
        buf
    }

    /// Parses the preamble, rejecting any deviation from the magic.
    /// Version and wire-format checks are the caller's responsibility
    /// so the error can name what actually mismatched.
    pub fn decode(raw: &[u8; 8]) -> Result<Self> {
        if raw[..4] != MAGIC {
            bail!("bad handshake magic: {:02x?}", &raw[..4]);
        }
        Ok(Self {
            version: u16::from_be_bytes([raw[4], raw[5]]),
            wire_format: raw[6],
            flags: HandshakeFlags::from_bits_truncate(raw[7]),
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut WireWriter<W>) -> Result<()> {
        w.write_raw(&self.encode()).await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self> {
        let mut raw = [0u8; 8];
        r.read_raw_exact(&mut raw)
            .await
            .context("failed to read handshake")?;
        Self::decode(&raw)
    }
}

// =============================================================================
// Record tags and enums
// =============================================================================

/// Frame tag identifying the record type of a typed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    FileListHdr = 1,
    SrcFile = 2,
    DstFile = 3,
    BlockSum = 4,
    FileDesc = 5,
    BlockType = 6,
    RemoteBlock = 7,
    LocalBlock = 8,
}

impl RecordTag {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::FileListHdr),
            2 => Some(Self::SrcFile),
            3 => Some(Self::DstFile),
            4 => Some(Self::BlockSum),
            5 => Some(Self::FileDesc),
            6 => Some(Self::BlockType),
            7 => Some(Self::RemoteBlock),
            8 => Some(Self::LocalBlock),
            _ => None,
        }
    }
}

/// Which peer a file list describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileListType {
    Sender = 1,
    Receiver = 2,
}

impl FileListType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Sender),
            2 => Some(Self::Receiver),
            _ => None,
        }
    }
}

/// Destination verdict for one source entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DstFileType {
    /// Exists but differs; block signatures follow.
    Similar = 0,
    /// Up to date, nothing to transfer.
    #[default]
    Identical = 1,
    /// Missing; the whole file must be shipped.
    NotExist = 2,
}

impl DstFileType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Similar),
            1 => Some(Self::Identical),
            2 => Some(Self::NotExist),
            _ => None,
        }
    }
}

/// Shape of one per-file delta stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    NewFile = 0,
    PartialFile = 1,
}

impl FileType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::NewFile),
            1 => Some(Self::PartialFile),
            _ => None,
        }
    }
}

/// Discriminates the records inside a partial-file delta stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    Remote = 0,
    Local = 1,
    FileSum = 2,
}

impl BlockType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Remote),
            1 => Some(Self::Local),
            2 => Some(Self::FileSum),
            _ => None,
        }
    }

    pub fn encode(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u32(1);
        buf.put_u8(RecordTag::BlockType as u8);
        buf.put_u8(self as u8);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 1 {
            bail!("BlockType payload too short");
        }
        let b = payload.get_u8();
        Self::from_u8(b).with_context(|| format!("unknown block type {b}"))
    }
}

// =============================================================================
// FileListHdr
// =============================================================================

/// Frames a file list; `delete_extra` is meaningful on sender lists only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileListHdr {
    pub num_files: u32,
    pub list_type: FileListType,
    pub delete_extra: bool,
}

impl FileListHdr {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 6);
        buf.put_u32(6);
        buf.put_u8(RecordTag::FileListHdr as u8);
        buf.put_u32(self.num_files);
        buf.put_u8(self.list_type as u8);
        buf.put_u8(self.delete_extra as u8);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 6 {
            bail!("FileListHdr payload too short");
        }
        let num_files = payload.get_u32();
        let list_type = payload.get_u8();
        let list_type =
            FileListType::from_u8(list_type).with_context(|| format!("bad list type {list_type}"))?;
        let delete_extra = payload.get_u8() != 0;
        Ok(Self {
            num_files,
            list_type,
            delete_extra,
        })
    }
}

// =============================================================================
// SrcFile
// =============================================================================

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// One source-tree entry, transmitted verbatim. `mode` is the full Unix
/// `st_mode`, including the file-type bits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SrcFile {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
}

impl SrcFile {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Permission bits only, suitable for chmod.
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn mtime(&self) -> filetime::FileTime {
        filetime::FileTime::from_unix_time(self.mtime_sec, self.mtime_nsec)
    }

    pub fn encode(&self) -> Bytes {
        let path_bytes = self.path.as_bytes();
        let payload_len = 2 + path_bytes.len() + 4 + 4 + 4 + 8 + 8 + 4;

        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(RecordTag::SrcFile as u8);
        buf.put_u16(path_bytes.len() as u16);
        buf.put_slice(path_bytes);
        buf.put_u32(self.uid);
        buf.put_u32(self.gid);
        buf.put_u32(self.mode);
        buf.put_u64(self.size);
        buf.put_i64(self.mtime_sec);
        buf.put_u32(self.mtime_nsec);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            bail!("SrcFile payload too short");
        }
        let path_len = payload.get_u16() as usize;
        if payload.remaining() < path_len + 32 {
            bail!("SrcFile payload truncated");
        }
        let path = String::from_utf8(payload.copy_to_bytes(path_len).to_vec())
            .context("invalid UTF-8 in SrcFile path")?;
        Ok(Self {
            path,
            uid: payload.get_u32(),
            gid: payload.get_u32(),
            mode: payload.get_u32(),
            size: payload.get_u64(),
            mtime_sec: payload.get_i64(),
            mtime_nsec: payload.get_u32(),
        })
    }
}

// =============================================================================
// DstFile
// =============================================================================

/// Receiver verdict for the source entry with the same ordinal id.
/// `Similar` entries are followed by `num_chunks()` BlockSum records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DstFile {
    pub id: u32,
    pub chunk_size: u32,
    pub size: u64,
    pub typ: DstFileType,
}

impl DstFile {
    pub fn num_chunks(&self) -> u32 {
        if self.chunk_size == 0 {
            return 0;
        }
        ((self.size + self.chunk_size as u64 - 1) / self.chunk_size as u64) as u32
    }

    pub fn last_chunk_id(&self) -> u32 {
        self.num_chunks().saturating_sub(1)
    }

    /// True size of the final chunk, which may be shorter than `chunk_size`.
    pub fn last_chunk_size(&self) -> u64 {
        let n = self.num_chunks() as u64;
        if n == 0 {
            return 0;
        }
        self.size - (n - 1) * self.chunk_size as u64
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 17);
        buf.put_u32(17);
        buf.put_u8(RecordTag::DstFile as u8);
        buf.put_u32(self.id);
        buf.put_u32(self.chunk_size);
        buf.put_u64(self.size);
        buf.put_u8(self.typ as u8);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 17 {
            bail!("DstFile payload too short");
        }
        let id = payload.get_u32();
        let chunk_size = payload.get_u32();
        let size = payload.get_u64();
        let typ = payload.get_u8();
        let typ =
            DstFileType::from_u8(typ).with_context(|| format!("bad dst file type {typ}"))?;
        Ok(Self {
            id,
            chunk_size,
            size,
            typ,
        })
    }
}

// =============================================================================
// BlockSum
// =============================================================================

/// Per-block signature: 32-bit rolling weak hash plus 16-byte MD5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSum {
    pub rsum: u32,
    pub csum: [u8; 16],
}

impl BlockSum {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 20);
        buf.put_u32(20);
        buf.put_u8(RecordTag::BlockSum as u8);
        buf.put_u32(self.rsum);
        buf.put_slice(&self.csum);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 20 {
            bail!("BlockSum payload too short");
        }
        let rsum = payload.get_u32();
        let mut csum = [0u8; 16];
        payload.copy_to_slice(&mut csum);
        Ok(Self { rsum, csum })
    }
}

// =============================================================================
// FileDesc
// =============================================================================

/// Header of one per-changed-file delta stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDesc {
    pub id: u32,
    pub typ: FileType,
    pub total_size: u64,
}

impl FileDesc {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 13);
        buf.put_u32(13);
        buf.put_u8(RecordTag::FileDesc as u8);
        buf.put_u32(self.id);
        buf.put_u8(self.typ as u8);
        buf.put_u64(self.total_size);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 13 {
            bail!("FileDesc payload too short");
        }
        let id = payload.get_u32();
        let typ = payload.get_u8();
        let typ = FileType::from_u8(typ).with_context(|| format!("bad file desc type {typ}"))?;
        let total_size = payload.get_u64();
        Ok(Self {
            id,
            typ,
            total_size,
        })
    }
}

// =============================================================================
// RemoteBlock / LocalBlock
// =============================================================================

/// Copy instruction: a run of consecutive chunks already present in the
/// destination file, written at `off` in the reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBlock {
    pub chunk_id: u32,
    pub nr_chunks: u32,
    pub off: u64,
}

impl RemoteBlock {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 16);
        buf.put_u32(16);
        buf.put_u8(RecordTag::RemoteBlock as u8);
        buf.put_u32(self.chunk_id);
        buf.put_u32(self.nr_chunks);
        buf.put_u64(self.off);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 16 {
            bail!("RemoteBlock payload too short");
        }
        Ok(Self {
            chunk_id: payload.get_u32(),
            nr_chunks: payload.get_u32(),
            off: payload.get_u64(),
        })
    }
}

/// Literal instruction: `size` raw bytes follow on the wire, written at
/// `off` in the reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalBlock {
    pub size: u64,
    pub off: u64,
}

impl LocalBlock {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + 16);
        buf.put_u32(16);
        buf.put_u8(RecordTag::LocalBlock as u8);
        buf.put_u64(self.size);
        buf.put_u64(self.off);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 16 {
            bail!("LocalBlock payload too short");
        }
        Ok(Self {
            size: payload.get_u64(),
            off: payload.get_u64(),
        })
    }
}

// =============================================================================
// Stream wrappers
// =============================================================================

/// Buffered frame reader that also hands out the raw bytes interleaved
/// between frames (literal payloads, digests, the round ack).
pub struct WireReader<R> {
    r: BufReader<R>,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            r: BufReader::new(inner),
        }
    }

    /// Reads one typed frame. Clean EOF before the first header byte
    /// yields `None`; EOF anywhere else is an error.
    pub async fn try_read_frame(&mut self) -> Result<Option<(RecordTag, Bytes)>> {
        let mut len_buf = [0u8; 4];
        let mut n = 0;
        while n < 4 {
            let k = self
                .r
                .read(&mut len_buf[n..])
                .await
                .context("failed to read frame length")?;
            if k == 0 {
                if n == 0 {
                    return Ok(None);
                }
                bail!("stream ended inside a frame header");
            }
            n += k;
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            bail!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}");
        }
        let tag = self.r.read_u8().await.context("failed to read frame tag")?;
        let tag = RecordTag::from_u8(tag).with_context(|| format!("unknown frame tag {tag}"))?;
        let mut payload = vec![0u8; len as usize];
        self.r
            .read_exact(&mut payload)
            .await
            .context("failed to read frame payload")?;
        Ok(Some((tag, Bytes::from(payload))))
    }

    pub async fn read_frame(&mut self) -> Result<(RecordTag, Bytes)> {
        match self.try_read_frame().await? {
            Some(frame) => Ok(frame),
            None => bail!("unexpected end of stream"),
        }
    }

    /// Reads a frame and insists on its tag.
    pub async fn expect(&mut self, want: RecordTag) -> Result<Bytes> {
        let (tag, payload) = self.read_frame().await?;
        if tag != want {
            bail!("unexpected record: got {tag:?}, want {want:?}");
        }
        Ok(payload)
    }

    pub async fn read_raw_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.r
            .read_exact(buf)
            .await
            .context("failed to read raw bytes")?;
        Ok(())
    }

    /// Reads up to `buf.len()` raw bytes, returning the count (0 on EOF).
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.r.read(buf).await?)
    }

    pub async fn read_ack(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_raw_exact(&mut buf).await.context("failed to read ack")?;
        Ok(u32::from_be_bytes(buf))
    }
}

/// Buffered writer for frames and raw bytes. Callers flush at phase
/// boundaries (end of a list, end of the delta streams, after the ack).
pub struct WireWriter<W> {
    w: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            w: BufWriter::new(inner),
        }
    }

    /// Writes a pre-encoded frame or a raw chunk; on this side of the
    /// protocol they are indistinguishable byte runs.
    pub async fn write_bytes(&mut self, b: &[u8]) -> Result<()> {
        self.w.write_all(b).await.context("failed to write")?;
        Ok(())
    }

    pub async fn write_raw(&mut self, b: &[u8]) -> Result<()> {
        self.write_bytes(b).await
    }

    pub async fn write_ack(&mut self, ack: u32) -> Result<()> {
        self.write_raw(&ack.to_be_bytes()).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.w.flush().await.context("failed to flush stream")?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(frame: &Bytes) -> Bytes {
        frame.slice(5..)
    }

    #[test]
    fn test_handshake_roundtrip() {
        let hs = Handshake::new(PROTOCOL_VERSION, WIRE_FORMAT_TYPED, HandshakeFlags::empty());
        let raw = hs.encode();
        assert_eq!(&raw[..4], b"psyn");
        let decoded = Handshake::decode(&raw).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn test_handshake_bad_magic() {
        let hs = Handshake::new(PROTOCOL_VERSION, WIRE_FORMAT_TYPED, HandshakeFlags::GZIP);
        let mut raw = hs.encode();
        raw[0] = b'q';
        assert!(Handshake::decode(&raw).is_err());
    }

    #[test]
    fn test_file_list_hdr_roundtrip() {
        let hdr = FileListHdr {
            num_files: 42,
            list_type: FileListType::Sender,
            delete_extra: true,
        };
        let decoded = FileListHdr::decode(payload(&hdr.encode())).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn test_src_file_roundtrip() {
        let f = SrcFile {
            path: "path/to/file1.bin".to_string(),
            uid: 1000,
            gid: 1003,
            mode: 0o100644,
            size: 233348971,
            mtime_sec: 1234567890,
            mtime_nsec: 500,
        };
        let decoded = SrcFile::decode(payload(&f.encode())).unwrap();
        assert_eq!(decoded, f);
        assert!(!decoded.is_dir());
        assert_eq!(decoded.perm(), 0o644);
    }

    #[test]
    fn test_src_file_dir_bit() {
        let d = SrcFile {
            path: "subdir".to_string(),
            uid: 0,
            gid: 0,
            mode: 0o040755,
            size: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
        };
        assert!(d.is_dir());
        assert_eq!(d.perm(), 0o755);
    }

    #[test]
    fn test_dst_file_roundtrip() {
        let d = DstFile {
            id: 3,
            chunk_size: 8,
            size: 57,
            typ: DstFileType::Similar,
        };
        let decoded = DstFile::decode(payload(&d.encode())).unwrap();
        assert_eq!(decoded, d);
    }

    #[test]
    fn test_dst_file_chunk_math() {
        let d = DstFile {
            id: 0,
            chunk_size: 8,
            size: 57,
            typ: DstFileType::Similar,
        };
        assert_eq!(d.num_chunks(), 8);
        assert_eq!(d.last_chunk_id(), 7);
        assert_eq!(d.last_chunk_size(), 1);

        let even = DstFile {
            id: 0,
            chunk_size: 8,
            size: 64,
            typ: DstFileType::Similar,
        };
        assert_eq!(even.num_chunks(), 8);
        assert_eq!(even.last_chunk_size(), 8);
    }

    #[test]
    fn test_dst_file_zero_chunk_size() {
        // Identical entries carry chunk_size 0; the chunk math must not
        // divide by it.
        let d = DstFile {
            id: 0,
            chunk_size: 0,
            size: 0,
            typ: DstFileType::Identical,
        };
        assert_eq!(d.num_chunks(), 0);
        assert_eq!(d.last_chunk_size(), 0);
    }

    #[test]
    fn test_block_sum_roundtrip() {
        let bs = BlockSum {
            rsum: 0x071c019d,
            csum: *b"0123456789abcdef",
        };
        let decoded = BlockSum::decode(payload(&bs.encode())).unwrap();
        assert_eq!(decoded, bs);
    }

    #[test]
    fn test_file_desc_roundtrip() {
        let fd = FileDesc {
            id: 7,
            typ: FileType::PartialFile,
            total_size: 59,
        };
        let decoded = FileDesc::decode(payload(&fd.encode())).unwrap();
        assert_eq!(decoded, fd);
    }

    #[test]
    fn test_block_records_roundtrip() {
        let rb = RemoteBlock {
            chunk_id: 5,
            nr_chunks: 3,
            off: 42,
        };
        assert_eq!(RemoteBlock::decode(payload(&rb.encode())).unwrap(), rb);

        let lb = LocalBlock { size: 10, off: 32 };
        assert_eq!(LocalBlock::decode(payload(&lb.encode())).unwrap(), lb);

        let bt = BlockType::FileSum;
        assert_eq!(BlockType::decode(payload(&bt.encode())).unwrap(), bt);
    }

    #[tokio::test]
    async fn test_frame_stream_roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut w = WireWriter::new(client);
        let mut r = WireReader::new(server);

        let hdr = FileListHdr {
            num_files: 1,
            list_type: FileListType::Receiver,
            delete_extra: false,
        };
        w.write_bytes(&hdr.encode()).await.unwrap();
        w.write_raw(b"raw bytes between frames").await.unwrap();
        w.write_bytes(&BlockType::Local.encode()).await.unwrap();
        w.flush().await.unwrap();

        let p = r.expect(RecordTag::FileListHdr).await.unwrap();
        assert_eq!(FileListHdr::decode(p).unwrap(), hdr);
        let mut raw = [0u8; 24];
        r.read_raw_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, b"raw bytes between frames");
        let p = r.expect(RecordTag::BlockType).await.unwrap();
        assert_eq!(BlockType::decode(p).unwrap(), BlockType::Local);
    }

    #[tokio::test]
    async fn test_unexpected_record_is_error() {
        let (client, server) = tokio::io::duplex(4096);
        let mut w = WireWriter::new(client);
        let mut r = WireReader::new(server);

        w.write_bytes(&BlockType::Remote.encode()).await.unwrap();
        w.flush().await.unwrap();
        assert!(r.expect(RecordTag::DstFile).await.is_err());
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut r = WireReader::new(server);
        assert!(r.try_read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let mut w = WireWriter::new(client);
        let mut r = WireReader::new(server);
        w.write_raw(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        w.flush().await.unwrap();
        assert!(r.try_read_frame().await.is_err());
    }
}
