// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;

use crate::{
    cli::{status, warning},
    format::sparse::{Chunk, Header, SparseInputStream},
    stream::{self, CountingReader},
    util::{MaybeNumBytes, NumBytes},
};

struct CompactView<'a, T>(&'a [T]);

impl<T: fmt::Debug> fmt::Debug for CompactView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for item in self.0 {
            // No alternate mode for no inner newlines.
            list.entry(&format_args!("{item:?}"));
        }

        list.finish()
    }
}

struct Metadata {
    header: Header,
    chunks: Vec<Chunk>,
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("header", &self.header)
            .field("expanded_size", &NumBytes(self.header.expanded_size()))
            .field("chunks", &CompactView(&self.chunks))
            .finish()
    }
}

fn open_reader(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))
}

fn open_writer(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to open for writing: {path:?}"))
}

/// Pick the size of the unpacked output. The header's expanded size is
/// authoritative. Otherwise, the size hint is used and, failing that, the size
/// of the input file.
fn target_size(expanded_size: Option<u64>, size_hint: Option<u64>, input_size: u64) -> u64 {
    expanded_size.or(size_hint).unwrap_or(input_size)
}

pub fn unpack_subcommand(cli: &UnpackCli, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let input_size = reader
        .metadata()
        .with_context(|| format!("Failed to get file size: {:?}", cli.input))?
        .len();

    let counting_reader = CountingReader::new(BufReader::new(reader));
    let mut sparse_stream = SparseInputStream::from_reader(counting_reader)
        .with_context(|| format!("Failed to detect image format: {:?}", cli.input))?;

    let expanded_size = sparse_stream.expanded_size();
    let size = target_size(expanded_size, cli.size_hint, input_size);

    if let (Some(expanded), Some(hint)) = (expanded_size, cli.size_hint)
        && expanded != hint
    {
        warning!(
            "Ignoring size hint {:?}: sparse header declares {:?}",
            NumBytes(hint),
            NumBytes(expanded),
        );
    }

    if sparse_stream.is_sparse() {
        status!("Unsparsing {:?} to {:?}", cli.input, NumBytes(size));
    } else {
        status!("Not a sparse image; copying {:?} as is", cli.input);
    }

    let mut writer = BufWriter::new(open_writer(&cli.output)?);
    let mut written = 0u64;
    let mut last_percent = None;

    let copied = stream::copy_inspect(
        &mut sparse_stream,
        &mut writer,
        |data| {
            written += data.len() as u64;

            if size != 0 {
                let percent = written.saturating_mul(100) / size;
                if last_percent != Some(percent) {
                    debug!("Progress: {percent}% ({written}/{size})");
                    last_percent = Some(percent);
                }
            }
        },
        cancel_signal,
    )
    .with_context(|| format!("Failed to copy data: {:?} -> {:?}", cli.input, cli.output))?;

    writer
        .flush()
        .with_context(|| format!("Failed to flush output: {:?}", cli.output))?;

    if let Some(expected) = expanded_size
        && copied != expected
    {
        bail!("Unpacked {copied} bytes, but sparse header declares {expected} bytes");
    }

    let (_, consumed) = sparse_stream.into_inner().into_inner().finish();

    status!(
        "Wrote {:?} from {:?} of input",
        NumBytes(copied),
        NumBytes(consumed),
    );

    Ok(())
}

pub fn info_subcommand(cli: &InfoCli, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = open_reader(&cli.input)?;
    let mut sparse_stream = SparseInputStream::from_reader(BufReader::new(reader))
        .with_context(|| format!("Failed to detect image format: {:?}", cli.input))?;

    let Some(header) = sparse_stream.header() else {
        println!(
            "Not a sparse image; expanded size: {:?}",
            MaybeNumBytes(sparse_stream.expanded_size()),
        );
        return Ok(());
    };

    let mut metadata = Metadata {
        header,
        chunks: vec![],
    };

    if cli.chunks {
        // The stream cannot seek, so walking the chunk table means draining
        // all of the data.
        let mut buf = vec![0u8; 16384];

        loop {
            stream::check_cancel(cancel_signal)?;

            let n = sparse_stream
                .read_expanded(&mut buf)
                .with_context(|| format!("Failed to read chunk data: {:?}", cli.input))?;
            if n == 0 {
                break;
            }

            if let Some(chunk) = sparse_stream.current_chunk()
                && metadata.chunks.last().map(|c| c.index) != Some(chunk.index)
            {
                metadata.chunks.push(chunk);
            }
        }
    }

    println!("{metadata:#?}");

    Ok(())
}

pub fn sparse_main(cli: &SparseCommand, cancel_signal: &AtomicBool) -> Result<()> {
    match cli {
        SparseCommand::Unpack(c) => unpack_subcommand(c, cancel_signal),
        SparseCommand::Info(c) => info_subcommand(c, cancel_signal),
    }
}

/// Unpack a sparse image.
///
/// If the input is not a sparse image, it is copied to the output unchanged.
#[derive(Debug, Parser)]
pub struct UnpackCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Path to output raw image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Expected output size when the input is not a sparse image.
    ///
    /// This is only used for progress reporting. If not specified, the input
    /// file size is used.
    #[arg(long, value_name = "BYTES")]
    pub size_hint: Option<u64>,
}

/// Display sparse image metadata.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Walk the chunk table and list every chunk that produces data.
    ///
    /// This requires reading the entire input.
    #[arg(long)]
    pub chunks: bool,
}

#[derive(Debug, Subcommand)]
pub enum SparseCommand {
    Unpack(UnpackCli),
    Info(InfoCli),
}
