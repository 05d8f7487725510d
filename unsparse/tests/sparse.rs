// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Cursor, Read};

use assert_matches::assert_matches;
use unsparse::{
    format::sparse::{
        self, CHUNK_TYPE_DONT_CARE, CHUNK_TYPE_FILL, CHUNK_TYPE_RAW, ChunkKind, Error,
        HEADER_MAGIC, SparseInputStream,
    },
    stream::PeekReader,
};

fn header_with(
    major_version: u16,
    minor_version: u16,
    block_size: u32,
    num_blocks: u32,
    num_chunks: u32,
) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
    data.extend_from_slice(&major_version.to_le_bytes());
    data.extend_from_slice(&minor_version.to_le_bytes());
    data.extend_from_slice(&28u16.to_le_bytes());
    data.extend_from_slice(&12u16.to_le_bytes());
    data.extend_from_slice(&block_size.to_le_bytes());
    data.extend_from_slice(&num_blocks.to_le_bytes());
    data.extend_from_slice(&num_chunks.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data
}

fn header(block_size: u32, num_blocks: u32, num_chunks: u32) -> Vec<u8> {
    header_with(
        sparse::MAJOR_VERSION,
        sparse::MINOR_VERSION,
        block_size,
        num_blocks,
        num_chunks,
    )
}

fn chunk(chunk_type: u16, num_blocks: u32, payload: &[u8]) -> Vec<u8> {
    let total_size = 12 + payload.len() as u32;

    let mut data = Vec::new();
    data.extend_from_slice(&chunk_type.to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&num_blocks.to_le_bytes());
    data.extend_from_slice(&total_size.to_le_bytes());
    data.extend_from_slice(payload);
    data
}

fn image(header: Vec<u8>, chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut data = header;
    for c in chunks {
        data.extend_from_slice(c);
    }
    data
}

fn open(data: &[u8]) -> SparseInputStream<PeekReader<Cursor<&[u8]>>> {
    SparseInputStream::from_reader(Cursor::new(data)).unwrap()
}

fn read_all_bytes<R: Read>(stream: &mut SparseInputStream<R>) -> Vec<u8> {
    let mut result = Vec::new();
    while let Some(b) = stream.read_byte().unwrap() {
        result.push(b);
    }
    result
}

#[test]
fn passthrough_bulk() {
    let data = b"This is definitely not a sparse image, just some bytes.";
    let mut stream = open(data);

    assert!(!stream.is_sparse());
    assert_eq!(stream.header(), None);
    assert_eq!(stream.expanded_size(), None);

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, data);
}

#[test]
fn passthrough_single_byte() {
    let data = b"0123456789abcdef0123456789abcdef";
    let mut stream = open(data);

    assert_eq!(read_all_bytes(&mut stream), data);
    assert_eq!(stream.read_byte().unwrap(), None);
}

#[test]
fn passthrough_short_input() {
    for data in [&b""[..], b"ab", b"\x3a\xff\x26"] {
        let mut stream = open(data);
        assert!(!stream.is_sparse());

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, data);
    }
}

#[test]
fn raw_chunk_scenario() {
    let data = image(
        header(4, 2, 1),
        &[chunk(CHUNK_TYPE_RAW, 2, &[1, 2, 3, 4, 5, 6, 7, 8])],
    );
    let mut stream = open(&data);

    assert!(stream.is_sparse());
    assert_eq!(stream.expanded_size(), Some(8));

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

    assert_eq!(stream.read_byte().unwrap(), None);
    assert_eq!(stream.read_expanded(&mut [0u8; 4]).unwrap(), 0);
}

#[test]
fn raw_chunk_single_byte() {
    let payload = (0..16).collect::<Vec<u8>>();
    let data = image(header(8, 2, 1), &[chunk(CHUNK_TYPE_RAW, 2, &payload)]);
    let mut stream = open(&data);

    assert_eq!(read_all_bytes(&mut stream), payload);
}

#[test]
fn dont_care_chunk() {
    let data = image(header(8, 3, 1), &[chunk(CHUNK_TYPE_DONT_CARE, 3, b"")]);
    let mut stream = SparseInputStream::new(PeekReader::new(Cursor::new(&data))).unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, [0u8; 24]);

    // Only the file header and the chunk header were consumed.
    let reader = stream.into_inner().into_inner();
    assert_eq!(reader.position(), 28 + 12);
}

#[test]
fn fill_chunk() {
    let data = image(
        header(8, 3, 1),
        &[chunk(CHUNK_TYPE_FILL, 3, &[0xde, 0xad, 0xbe, 0xef])],
    );
    let expected = [0xdeu8, 0xad, 0xbe, 0xef].repeat(6);

    let mut stream = open(&data);
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, expected);

    let mut stream = open(&data);
    assert_eq!(read_all_bytes(&mut stream), expected);
}

#[test]
fn fill_chunk_odd_reads() {
    let data = image(
        header(4, 4, 1),
        &[chunk(CHUNK_TYPE_FILL, 4, &[1, 2, 3, 4])],
    );
    let mut stream = open(&data);

    // Split reads at offsets that are not aligned to the pattern.
    let mut output = Vec::new();
    let mut buf = [0u8; 3];
    loop {
        let n = stream.read_expanded(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        output.extend_from_slice(&buf[..n]);

        if let Some(b) = stream.read_byte().unwrap() {
            output.push(b);
        }
    }

    assert_eq!(output, [1u8, 2, 3, 4].repeat(4));
}

#[test]
fn reads_do_not_cross_chunks() {
    let data = image(
        header(4, 3, 3),
        &[
            chunk(CHUNK_TYPE_RAW, 1, b"abcd"),
            chunk(CHUNK_TYPE_DONT_CARE, 1, b""),
            chunk(CHUNK_TYPE_FILL, 1, b"wxyz"),
        ],
    );
    let mut stream = open(&data);
    let mut buf = [0xffu8; 64];

    assert_eq!(stream.read_expanded(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"abcd");
    assert_eq!(stream.current_chunk().unwrap().kind, ChunkKind::Raw);

    assert_eq!(stream.read_expanded(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"\0\0\0\0");
    assert_eq!(stream.current_chunk().unwrap().kind, ChunkKind::DontCare);

    assert_eq!(stream.read_expanded(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"wxyz");
    assert_eq!(
        stream.current_chunk().unwrap().kind,
        ChunkKind::Fill(*b"wxyz"),
    );

    assert_eq!(stream.read_expanded(&mut buf).unwrap(), 0);
    assert_eq!(stream.current_chunk(), None);
}

#[test]
fn mixed_image() {
    let data = image(
        header(4, 6, 5),
        &[
            chunk(CHUNK_TYPE_DONT_CARE, 1, b""),
            chunk(CHUNK_TYPE_RAW, 2, b"01234567"),
            chunk(CHUNK_TYPE_RAW, 0, b""),
            chunk(CHUNK_TYPE_FILL, 2, b"ab\xcd\xef"),
            chunk(CHUNK_TYPE_DONT_CARE, 1, b""),
        ],
    );
    let expected = b"\0\0\0\001234567ab\xcd\xefab\xcd\xef\0\0\0\0";

    let mut stream = open(&data);
    assert_eq!(stream.expanded_size(), Some(24));

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, expected);

    let mut stream = open(&data);
    assert_eq!(read_all_bytes(&mut stream), expected);
}

#[test]
fn empty_chunks_do_not_end_stream() {
    let data = image(
        header(4, 1, 3),
        &[
            chunk(CHUNK_TYPE_RAW, 0, b""),
            chunk(CHUNK_TYPE_FILL, 0, b"\x01\x02\x03\x04"),
            chunk(CHUNK_TYPE_RAW, 1, b"abcd"),
        ],
    );
    let mut stream = open(&data);

    let mut buf = [0u8; 8];
    assert_eq!(stream.read_expanded(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"abcd");
    assert_eq!(stream.current_chunk().unwrap().index, 2);
}

#[test]
fn no_chunks() {
    let data = header(4096, 0, 0);
    let mut stream = open(&data);

    assert_eq!(stream.expanded_size(), Some(0));
    assert_eq!(stream.read_byte().unwrap(), None);
}

#[test]
fn trailing_data_ignored() {
    let mut data = image(header(4, 1, 1), &[chunk(CHUNK_TYPE_RAW, 1, b"abcd")]);
    data.extend_from_slice(b"trailing garbage");
    data.extend_from_slice(&chunk(CHUNK_TYPE_RAW, 1, b"efgh"));

    let mut stream = open(&data);
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"abcd");
}

#[test]
fn empty_buffer() {
    let data = image(header(4, 1, 1), &[chunk(CHUNK_TYPE_RAW, 1, b"abcd")]);
    let mut stream = open(&data);

    assert_eq!(stream.read_expanded(&mut []).unwrap(), 0);
    assert_eq!(stream.current_chunk(), None);

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"abcd");
}

#[test]
fn version_zero_accepted() {
    let data = image(
        header_with(0, 0, 4, 1, 1),
        &[chunk(CHUNK_TYPE_RAW, 1, b"abcd")],
    );
    let stream = open(&data);

    assert_eq!(stream.header().unwrap().major_version, 0);
}

#[test]
fn unsupported_version() {
    let data = header_with(2, 0, 4096, 0, 0);
    assert_matches!(
        SparseInputStream::from_reader(Cursor::new(&data)),
        Err(Error::UnsupportedVersion { major: 2, minor: 0 })
    );

    let data = header_with(1, 1, 4096, 0, 0);
    assert_matches!(
        SparseInputStream::from_reader(Cursor::new(&data)),
        Err(Error::UnsupportedVersion { major: 1, minor: 1 })
    );
}

#[test]
fn invalid_block_size() {
    let data = header(5, 0, 0);
    assert_matches!(
        SparseInputStream::from_reader(Cursor::new(&data)),
        Err(Error::InvalidBlockSize(5))
    );
}

#[test]
fn invalid_header_layout() {
    let mut data = header(4096, 0, 0);
    data[8..10].copy_from_slice(&32u16.to_le_bytes());
    assert_matches!(
        SparseInputStream::from_reader(Cursor::new(&data)),
        Err(Error::InvalidHeaderLayout {
            file_header_size: 32,
            chunk_header_size: 12,
        })
    );

    let mut data = header(4096, 0, 0);
    data[10..12].copy_from_slice(&16u16.to_le_bytes());
    assert_matches!(
        SparseInputStream::from_reader(Cursor::new(&data)),
        Err(Error::InvalidHeaderLayout {
            file_header_size: 28,
            chunk_header_size: 16,
        })
    );
}

#[test]
fn truncated_header() {
    let data = header(4096, 0, 0);
    assert_matches!(
        SparseInputStream::from_reader(Cursor::new(&data[..20])),
        Err(Error::TruncatedSource("header", _))
    );
}

#[test]
fn truncated_raw_chunk() {
    let data = image(header(4, 2, 1), &[chunk(CHUNK_TYPE_RAW, 2, b"abcdef")]);

    let mut stream = open(&data);
    let mut buf = [0u8; 16];
    assert_eq!(stream.read_expanded(&mut buf).unwrap(), 6);
    assert_matches!(
        stream.read_expanded(&mut buf),
        Err(Error::TruncatedSource("chunk_data", _))
    );

    let mut stream = open(&data);
    for _ in 0..6 {
        stream.read_byte().unwrap();
    }
    assert_matches!(
        stream.read_byte(),
        Err(Error::TruncatedSource("chunk_data", _))
    );

    let mut stream = open(&data);
    let err = stream.read_to_end(&mut Vec::new()).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}

#[test]
fn truncated_fill_value() {
    let data = image(header(4, 1, 1), &[chunk(CHUNK_TYPE_FILL, 1, b"ab")]);
    let mut stream = open(&data);

    assert_matches!(
        stream.read_byte(),
        Err(Error::TruncatedSource("chunk_fill_value", _))
    );
}

#[test]
fn missing_chunks() {
    // The header declares more chunks than are present.
    let data = image(header(4, 2, 2), &[chunk(CHUNK_TYPE_RAW, 1, b"abcd")]);
    let mut stream = open(&data);

    let mut buf = [0u8; 8];
    assert_eq!(stream.read_expanded(&mut buf).unwrap(), 4);
    assert_matches!(
        stream.read_expanded(&mut buf),
        Err(Error::TruncatedSource("chunk", _))
    );
}

#[test]
fn unsupported_chunk_type() {
    // CRC32 chunks are not supported.
    let data = image(
        header(4, 2, 2),
        &[
            chunk(CHUNK_TYPE_RAW, 1, b"abcd"),
            chunk(0xcac4, 1, b"\0\0\0\0"),
        ],
    );
    let mut stream = open(&data);

    let mut buf = [0u8; 8];
    assert_eq!(stream.read_expanded(&mut buf).unwrap(), 4);
    assert_matches!(
        stream.read_expanded(&mut buf),
        Err(Error::UnsupportedChunkType {
            index: 1,
            chunk_type: 0xcac4,
        })
    );

    let data = image(header(4, 1, 1), &[chunk(0x1234, 1, b"")]);
    let mut stream = open(&data);

    let err = stream.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);

    // The chunk stays active, so later reads keep failing.
    assert_matches!(
        stream.read_byte(),
        Err(Error::UnsupportedChunkType {
            index: 0,
            chunk_type: 0x1234,
        })
    );
}

#[test]
fn empty_unknown_chunk_skipped() {
    let data = image(
        header(4, 1, 2),
        &[
            chunk(0x1234, 0, b""),
            chunk(CHUNK_TYPE_DONT_CARE, 1, b""),
        ],
    );

    let mut stream = open(&data);
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, [0u8; 4]);

    let mut stream = open(&data);
    assert_eq!(read_all_bytes(&mut stream), [0u8; 4]);
}

#[test]
fn huge_chunk_expands_lazily() {
    let data = image(
        header(0xffff_fffc, 0xffff_ffff, 1),
        &[chunk(CHUNK_TYPE_DONT_CARE, 0xffff_ffff, b"")],
    );
    let mut stream = open(&data);

    assert_eq!(
        stream.expanded_size(),
        Some(0xffff_fffc * 0xffff_ffff),
    );

    let mut buf = Vec::new();
    (&mut stream).take(1 << 20).read_to_end(&mut buf).unwrap();
    assert_eq!(buf.len(), 1 << 20);
    assert!(buf.iter().all(|b| *b == 0));

    let chunk = stream.current_chunk().unwrap();
    assert_eq!(chunk.expanded_len(0xffff_fffc), 0xffff_fffc * 0xffff_ffff);
}
