// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
};

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// A reader that can look at an upcoming window of bytes and then return to
/// where it was before the window was read. This is the mark/reset capability
/// needed for detecting a file format without committing to it.
pub trait PeekRewind: Read {
    /// Read up to `size` bytes starting at the current position. Fewer bytes
    /// are returned only if EOF is reached. The returned bytes count as
    /// consumed until [`Self::rewind`] is called.
    fn peek_window(&mut self, size: usize) -> io::Result<&[u8]>;

    /// Return to the position before the most recent [`Self::peek_window`]
    /// call. Calling this without a prior peek is a no-op.
    fn rewind(&mut self);
}

impl<T: PeekRewind + ?Sized> PeekRewind for &mut T {
    fn peek_window(&mut self, size: usize) -> io::Result<&[u8]> {
        (**self).peek_window(size)
    }

    fn rewind(&mut self) {
        (**self).rewind()
    }
}

/// A buffering adapter that adds [`PeekRewind`] to any reader. Only the bytes
/// of the most recent peek window are buffered. Once they are read back, reads
/// go directly to the underlying reader.
pub struct PeekReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Read position within `buf`.
    pos: usize,
    /// Position to return to on rewind.
    mark: usize,
}

impl<R: Read> PeekReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            mark: 0,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Number of peeked bytes that have not been read back yet.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Return the underlying reader. Any peeked bytes that were not read back
    /// are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> PeekRewind for PeekReader<R> {
    fn peek_window(&mut self, size: usize) -> io::Result<&[u8]> {
        // The window always starts at the beginning of the buffer.
        self.buf.drain(..self.pos);
        self.pos = 0;
        self.mark = 0;

        while self.buf.len() < size {
            let start = self.buf.len();
            self.buf.resize(size, 0);

            match self.inner.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    break;
                }
                Ok(n) => self.buf.truncate(start + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.buf.truncate(start),
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e);
                }
            }
        }

        self.pos = self.buf.len().min(size);

        Ok(&self.buf[..self.pos])
    }

    fn rewind(&mut self) {
        self.pos = self.mark;
    }
}

impl<R: Read> Read for PeekReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.buf.len() {
            let n = buf.len().min(self.buf.len() - self.pos);
            buf[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;

            return Ok(n);
        }

        if !self.buf.is_empty() {
            self.buf.clear();
            self.pos = 0;
            self.mark = 0;
        }

        self.inner.read(buf)
    }
}

/// A small wrapper to keep track of the number of bytes read.
pub struct CountingReader<R> {
    inner: R,
    read: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, read: 0 }
    }

    pub fn count(&self) -> u64 {
        self.read
    }

    pub fn finish(self) -> (R, u64) {
        (self.inner, self.read)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        Ok(n)
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF, invoking
/// `inspect` after every buffer read iteration. If `writer` reaches EOF before
/// `reader` does, an error is returned. The operation is cancelled on the next
/// loop iteration if `cancel_signal` is set to `true`.
pub fn copy_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = [0u8; 16384];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        inspect(&buf[..n]);

        writer.write_all(&buf[..n])?;

        copied += n as u64;
    }

    Ok(copied)
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF.
pub fn copy(reader: impl Read, writer: impl Write, cancel_signal: &AtomicBool) -> io::Result<u64> {
    copy_inspect(reader, writer, |_| {}, cancel_signal)
}
