// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Streaming decoder for Android sparse images.
//!
//! [`SparseInputStream`] peeks at the start of its source to decide whether
//! the data is a sparse image. If it is, the chunks are expanded lazily as the
//! caller reads. Otherwise, every read is passed straight through to the
//! source.

use std::{
    fmt,
    io::{self, Read},
    mem,
};

use thiserror::Error;
use tracing::{debug, trace, warn};
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stream::{PeekReader, PeekRewind, ReadFixedSizeExt};

/// Magic value for [`RawHeader::magic`].
pub const HEADER_MAGIC: u32 = 0xed26ff3a;

/// Raw chunk type for [`RawChunk::chunk_type`].
pub const CHUNK_TYPE_RAW: u16 = 0xcac1;
/// Fill chunk type for [`RawChunk::chunk_type`].
pub const CHUNK_TYPE_FILL: u16 = 0xcac2;
/// Hole chunk type for [`RawChunk::chunk_type`].
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;

/// Highest supported major version.
pub const MAJOR_VERSION: u16 = 1;
/// Supported minor version.
pub const MINOR_VERSION: u16 = 0;

/// Size of the file header on the wire.
pub const HEADER_SIZE: usize = mem::size_of::<RawHeader>();
/// Size of a chunk header on the wire.
pub const CHUNK_HEADER_SIZE: usize = mem::size_of::<RawChunk>();

#[derive(Debug, Error)]
pub enum Error {
    // Header errors.
    #[error("Unsupported sparse version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error(
        "Invalid header sizes: file header {file_header_size} != {file}, \
        chunk header {chunk_header_size} != {chunk}",
        file = HEADER_SIZE,
        chunk = CHUNK_HEADER_SIZE,
    )]
    InvalidHeaderLayout {
        file_header_size: u16,
        chunk_header_size: u16,
    },
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    // Chunk errors.
    #[error("Chunk #{index}: Unsupported type: {chunk_type:#06x}")]
    UnsupportedChunkType { index: u32, chunk_type: u16 },
    // Wrapped errors.
    #[error("Sparse data ended prematurely: {0}")]
    TruncatedSource(&'static str, #[source] io::Error),
    #[error("Failed to read sparse data: {0}")]
    DataRead(&'static str, #[source] io::Error),
}

impl Error {
    /// Wrap an I/O error from reading `field`. Hitting EOF in the middle of a
    /// structure is reported as truncation.
    fn read(field: &'static str, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::TruncatedSource(field, e)
        } else {
            Self::DataRead(field, e)
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::TruncatedSource(_, _) => io::ErrorKind::UnexpectedEof,
            Error::DataRead(_, inner) => inner.kind(),
            _ => io::ErrorKind::InvalidData,
        };

        io::Error::new(kind, e)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    /// Major version. Must not exceed [`MAJOR_VERSION`].
    major_version: little_endian::U16,
    /// Minor version. Must be [`MINOR_VERSION`].
    minor_version: little_endian::U16,
    /// Size of this [`RawHeader`].
    file_hdr_sz: little_endian::U16,
    /// Size of a [`RawChunk`].
    chunk_hdr_sz: little_endian::U16,
    /// Block size in bytes. Must be a multiple of 4.
    blk_sz: little_endian::U32,
    /// Number of blocks when unsparsed.
    total_blks: little_endian::U32,
    /// Number of chunks.
    total_chunks: little_endian::U32,
    /// CRC32 checksum of the original data. Not validated.
    image_checksum: little_endian::U32,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("major_version", &self.major_version.get())
            .field("minor_version", &self.minor_version.get())
            .field("file_hdr_sz", &self.file_hdr_sz.get())
            .field("chunk_hdr_sz", &self.chunk_hdr_sz.get())
            .field("blk_sz", &self.blk_sz.get())
            .field("total_blks", &self.total_blks.get())
            .field("total_chunks", &self.total_chunks.get())
            .field(
                "image_checksum",
                &format_args!("{:#010x}", self.image_checksum.get()),
            )
            .finish()
    }
}

impl RawHeader {
    /// Check everything aside from the magic, which decides between sparse and
    /// passthrough mode instead of being an error.
    fn validate(&self) -> Result<()> {
        let major = self.major_version.get();
        let minor = self.minor_version.get();

        if major > MAJOR_VERSION || minor != MINOR_VERSION {
            return Err(Error::UnsupportedVersion { major, minor });
        }

        if usize::from(self.file_hdr_sz.get()) != HEADER_SIZE
            || usize::from(self.chunk_hdr_sz.get()) != CHUNK_HEADER_SIZE
        {
            return Err(Error::InvalidHeaderLayout {
                file_header_size: self.file_hdr_sz.get(),
                chunk_header_size: self.chunk_hdr_sz.get(),
            });
        }

        if self.blk_sz.get() == 0 || self.blk_sz.get() % 4 != 0 {
            return Err(Error::InvalidBlockSize(self.blk_sz.get()));
        }

        Ok(())
    }

    fn to_header(&self) -> Header {
        Header {
            major_version: self.major_version.get(),
            minor_version: self.minor_version.get(),
            block_size: self.blk_sz.get(),
            num_blocks: self.total_blks.get(),
            num_chunks: self.total_chunks.get(),
            crc32: self.image_checksum.get(),
        }
    }
}

/// Raw on-disk layout for the chunk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunk {
    /// Chunk type. Must be [`CHUNK_TYPE_RAW`], [`CHUNK_TYPE_FILL`], or
    /// [`CHUNK_TYPE_DONT_CARE`].
    chunk_type: little_endian::U16,
    /// Unused.
    reserved1: little_endian::U16,
    /// Number of unsparsed blocks this chunk represents.
    chunk_sz: little_endian::U32,
    /// The size in bytes of this chunk, including this [`RawChunk`].
    total_sz: little_endian::U32,
}

impl fmt::Debug for RawChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChunk")
            .field("chunk_type", &format_args!("{:#06x}", self.chunk_type.get()))
            .field("reserved1", &format_args!("{:#06x}", self.reserved1.get()))
            .field("chunk_sz", &self.chunk_sz.get())
            .field("total_sz", &self.total_sz.get())
            .finish()
    }
}

/// Sparse file header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major_version: u16,
    pub minor_version: u16,
    /// Block size in bytes. Always a non-zero multiple of 4.
    pub block_size: u32,
    /// Number of blocks when unsparsed.
    pub num_blocks: u32,
    /// Number of chunks.
    pub num_chunks: u32,
    /// CRC32 checksum of the original data. This is informational only.
    pub crc32: u32,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("major_version", &self.major_version)
            .field("minor_version", &self.minor_version)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("num_chunks", &self.num_chunks)
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .finish()
    }
}

impl Header {
    /// Size of the data when unsparsed. This cannot overflow.
    pub fn expanded_size(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.num_blocks)
    }
}

/// How a chunk's bytes are produced.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Literal data follows the chunk header.
    Raw,
    /// The chunk repeats this 4-byte pattern.
    Fill([u8; 4]),
    /// The chunk is a hole that reads back as zeros.
    DontCare,
    /// A chunk type this decoder does not know how to expand.
    Unknown(u16),
}

impl fmt::Debug for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "Raw"),
            Self::Fill(pattern) => f
                .debug_tuple("Fill")
                .field(&format_args!("{:#010x}", u32::from_le_bytes(*pattern)))
                .finish(),
            Self::DontCare => write!(f, "DontCare"),
            Self::Unknown(chunk_type) => f
                .debug_tuple("Unknown")
                .field(&format_args!("{chunk_type:#06x}"))
                .finish(),
        }
    }
}

impl ChunkKind {
    fn from_raw(chunk_type: u16, fill: Option<[u8; 4]>) -> Self {
        match (chunk_type, fill) {
            (CHUNK_TYPE_RAW, _) => Self::Raw,
            (CHUNK_TYPE_FILL, Some(pattern)) => Self::Fill(pattern),
            (CHUNK_TYPE_DONT_CARE, _) => Self::DontCare,
            (t, _) => Self::Unknown(t),
        }
    }

    /// Number of payload bytes stored after the chunk header.
    fn payload_size(&self, expanded_len: u64) -> u64 {
        match self {
            Self::Raw => expanded_len,
            Self::Fill(_) => 4,
            Self::DontCare | Self::Unknown(_) => 0,
        }
    }
}

/// A decoded chunk header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position in the chunk table.
    pub index: u32,
    pub kind: ChunkKind,
    /// Number of unsparsed blocks.
    pub num_blocks: u32,
    /// Declared on-wire size, including the chunk header.
    pub total_size: u32,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("num_blocks", &self.num_blocks)
            .field("total_size", &self.total_size)
            .finish()
    }
}

impl Chunk {
    /// Number of bytes this chunk expands to.
    pub fn expanded_len(&self, block_size: u32) -> u64 {
        u64::from(self.num_blocks) * u64::from(block_size)
    }
}

/// Pick the byte of `pattern` that is due when `remain` bytes of a fill chunk
/// are still owed. Chunk lengths are multiples of 4, so the first byte of a
/// chunk is always `pattern[0]`.
#[inline]
fn fill_byte(pattern: &[u8; 4], remain: u64) -> u8 {
    pattern[((4 - remain % 4) % 4) as usize]
}

/// Scanning state for the chunk table.
#[derive(Debug, Default)]
struct ChunkCursor {
    /// Number of chunk headers read so far.
    consumed: u32,
    /// Most recently loaded chunk.
    chunk: Option<Chunk>,
    /// Expanded bytes still owed by [`Self::chunk`].
    remain: u64,
    /// Set once the chunk table has been fully consumed.
    exhausted: bool,
}

impl ChunkCursor {
    /// Load chunk headers until one with unread bytes is found. Returns
    /// [`None`] once every declared chunk has been consumed. Empty chunks are
    /// skipped.
    fn prepare(&mut self, mut reader: impl Read, header: &RawHeader) -> Result<Option<Chunk>> {
        // An unsupported chunk stays active so that every later read fails.
        if self.remain != 0
            && let Some(Chunk {
                index,
                kind: ChunkKind::Unknown(chunk_type),
                ..
            }) = self.chunk
        {
            return Err(Error::UnsupportedChunkType { index, chunk_type });
        }

        while self.remain == 0 {
            if self.exhausted {
                return Ok(None);
            }

            if self.consumed == header.total_chunks.get() {
                debug!("Reached end of chunk table after {} chunks", self.consumed);
                self.exhausted = true;
                self.chunk = None;
                return Ok(None);
            }

            let raw_chunk =
                RawChunk::read_from_io(&mut reader).map_err(|e| Error::read("chunk", e))?;
            let index = self.consumed;
            self.consumed += 1;

            let fill = if raw_chunk.chunk_type.get() == CHUNK_TYPE_FILL {
                let pattern = reader
                    .read_array_exact::<4>()
                    .map_err(|e| Error::read("chunk_fill_value", e))?;
                Some(pattern)
            } else {
                None
            };

            let chunk = Chunk {
                index,
                kind: ChunkKind::from_raw(raw_chunk.chunk_type.get(), fill),
                num_blocks: raw_chunk.chunk_sz.get(),
                total_size: raw_chunk.total_sz.get(),
            };

            self.chunk = Some(chunk);
            self.remain = chunk.expanded_len(header.blk_sz.get());

            let expected_size = chunk.kind.payload_size(self.remain) + CHUNK_HEADER_SIZE as u64;
            if u64::from(chunk.total_size) != expected_size {
                warn!(
                    "Chunk #{index}: Declared size {} does not match expected size {expected_size}",
                    chunk.total_size,
                );
            }

            if self.remain == 0 {
                trace!("Skipping empty chunk: {chunk:?}");
                continue;
            }

            // Unknown types only fail once the chunk has bytes to produce.
            if let ChunkKind::Unknown(chunk_type) = chunk.kind {
                return Err(Error::UnsupportedChunkType { index, chunk_type });
            }

            debug!("Activated chunk: {chunk:?}");
        }

        Ok(self.chunk)
    }
}

#[derive(Debug)]
enum Mode {
    /// The source is not a sparse image.
    Passthrough,
    Sparse {
        header: RawHeader,
        cursor: ChunkCursor,
    },
}

/// A reader that unsparses a sparse image on the fly or, if the source is not
/// a sparse image, passes the data through unmodified.
///
/// Each read returns bytes from at most one chunk. Use [`Read::read_exact`] or
/// [`Read::read_to_end`] to read across chunk boundaries.
pub struct SparseInputStream<R> {
    inner: R,
    mode: Mode,
}

impl<R> fmt::Debug for SparseInputStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseInputStream")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl<R: Read> SparseInputStream<PeekReader<R>> {
    /// Create a new stream from a reader without peek support by wrapping it
    /// in a [`PeekReader`].
    pub fn from_reader(inner: R) -> Result<Self> {
        Self::new(PeekReader::new(inner))
    }
}

impl<R: PeekRewind> SparseInputStream<R> {
    /// Detect the format of `inner`. If the sparse magic is not present, the
    /// source is rewound and the stream operates in passthrough mode. If the
    /// magic is present, but the header is invalid, an error is returned.
    pub fn new(mut inner: R) -> Result<Self> {
        let (magic, raw_header) = {
            let window = inner
                .peek_window(HEADER_SIZE)
                .map_err(|e| Error::DataRead("header", e))?;

            let magic = little_endian::U32::read_from_prefix(window)
                .ok()
                .map(|(m, _)| m.get());

            (magic, RawHeader::read_from_bytes(window).ok())
        };

        if magic != Some(HEADER_MAGIC) {
            inner.rewind();
            debug!("Sparse magic not found; passing data through");

            return Ok(Self {
                inner,
                mode: Mode::Passthrough,
            });
        }

        let Some(header) = raw_header else {
            return Err(Error::TruncatedSource(
                "header",
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("Expected {HEADER_SIZE} byte header after sparse magic"),
                ),
            ));
        };

        header.validate()?;

        debug!("Sparse image detected: {header:?}");

        Ok(Self {
            inner,
            mode: Mode::Sparse {
                header,
                cursor: ChunkCursor::default(),
            },
        })
    }
}

impl<R: Read> SparseInputStream<R> {
    /// Whether the source was detected as a sparse image.
    pub fn is_sparse(&self) -> bool {
        matches!(self.mode, Mode::Sparse { .. })
    }

    /// Get the sparse file header. This is [`None`] in passthrough mode.
    pub fn header(&self) -> Option<Header> {
        match &self.mode {
            Mode::Passthrough => None,
            Mode::Sparse { header, .. } => Some(header.to_header()),
        }
    }

    /// Get the size of the data when unsparsed. This is [`None`] in
    /// passthrough mode because the size cannot be known without reading the
    /// whole source.
    pub fn expanded_size(&self) -> Option<u64> {
        self.header().map(|h| h.expanded_size())
    }

    /// Get the most recently loaded chunk. This is [`None`] before the first
    /// read, after the chunk table is exhausted, and in passthrough mode.
    pub fn current_chunk(&self) -> Option<Chunk> {
        match &self.mode {
            Mode::Passthrough => None,
            Mode::Sparse { cursor, .. } => cursor.chunk,
        }
    }

    /// Return the underlying source.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read expanded bytes into `buf`. Returns 0 at the end of the stream.
    /// The bytes returned by a single call come from at most one chunk.
    pub fn read_expanded(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let (header, cursor) = match &mut self.mode {
            Mode::Passthrough => {
                return self
                    .inner
                    .read(buf)
                    .map_err(|e| Error::DataRead("passthrough", e));
            }
            Mode::Sparse { header, cursor } => (header, cursor),
        };

        let Some(chunk) = cursor.prepare(&mut self.inner, header)? else {
            return Ok(0);
        };

        let to_read = usize::try_from(cursor.remain)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let buf = &mut buf[..to_read];

        let n = match chunk.kind {
            ChunkKind::Raw => {
                let n = self
                    .inner
                    .read(buf)
                    .map_err(|e| Error::DataRead("chunk_data", e))?;
                if n == 0 {
                    return Err(Error::TruncatedSource(
                        "chunk_data",
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "Chunk #{}: Reached EOF with {} bytes remaining",
                                chunk.index, cursor.remain,
                            ),
                        ),
                    ));
                }
                n
            }
            ChunkKind::Fill(pattern) => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = fill_byte(&pattern, cursor.remain - i as u64);
                }
                to_read
            }
            ChunkKind::DontCare => {
                buf.fill(0);
                to_read
            }
            ChunkKind::Unknown(chunk_type) => {
                return Err(Error::UnsupportedChunkType {
                    index: chunk.index,
                    chunk_type,
                });
            }
        };

        cursor.remain -= n as u64;

        Ok(n)
    }

    /// Read a single expanded byte. Returns [`None`] at the end of the stream.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let (header, cursor) = match &mut self.mode {
            Mode::Passthrough => {
                let mut byte = [0u8; 1];

                return match self.inner.read_exact(&mut byte) {
                    Ok(()) => Ok(Some(byte[0])),
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
                    Err(e) => Err(Error::DataRead("passthrough", e)),
                };
            }
            Mode::Sparse { header, cursor } => (header, cursor),
        };

        let Some(chunk) = cursor.prepare(&mut self.inner, header)? else {
            return Ok(None);
        };

        let byte = match chunk.kind {
            ChunkKind::Raw => {
                let [byte] = self
                    .inner
                    .read_array_exact::<1>()
                    .map_err(|e| Error::read("chunk_data", e))?;
                byte
            }
            ChunkKind::Fill(pattern) => fill_byte(&pattern, cursor.remain),
            ChunkKind::DontCare => 0,
            ChunkKind::Unknown(chunk_type) => {
                return Err(Error::UnsupportedChunkType {
                    index: chunk.index,
                    chunk_type,
                });
            }
        };

        cursor.remain -= 1;

        Ok(Some(byte))
    }
}

impl<R: Read> Read for SparseInputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Mode::Passthrough = self.mode {
            return self.inner.read(buf);
        }

        self.read_expanded(buf).map_err(io::Error::from)
    }
}
