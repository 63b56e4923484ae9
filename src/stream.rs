//! Buffered streams over the parent's ends of the child's pipes.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use crate::{Channel, Channels, Error, Result};

enum Inner {
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
    Closed,
}

/// A blocking, buffered stream bound to one pipe descriptor.
///
/// The stream owns the descriptor: it is closed exactly once, by [`close()`](Self::close) or when
/// the stream is dropped. A stream for the child's stdin is write-only; the others are
/// read-only.
pub struct Stream {
    channel: Channel,
    inner: Inner,
}

impl Stream {
    pub(crate) fn new(channel: Channel, fd: OwnedFd) -> Self {
        let file = File::from(fd);
        let inner = if channel.is_input() {
            Inner::Writer(BufWriter::new(file))
        } else {
            Inner::Reader(BufReader::new(file))
        };

        Self { channel, inner }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.inner, Inner::Closed)
    }

    /// The underlying descriptor, or `None` once the stream is closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.inner {
            Inner::Reader(r) => Some(r.get_ref().as_raw_fd()),
            Inner::Writer(w) => Some(w.get_ref().as_raw_fd()),
            Inner::Closed => None,
        }
    }

    fn io_error(&self, transferred: usize, source: io::Error) -> Error {
        Error::StreamIo {
            channel: self.channel,
            transferred,
            source,
        }
    }

    fn closed_error(&self) -> Error {
        Error::StreamClosed {
            channel: self.channel,
        }
    }

    fn wrong_direction(&self, transferred: usize) -> Error {
        self.io_error(
            transferred,
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} stream does not support this direction", self.channel),
            ),
        )
    }

    /// Fill `buf` completely.
    ///
    /// Returns `buf.len()` on success. If the child closes its end or an I/O error occurs first,
    /// the error carries the number of bytes that did arrive (and are in `buf`).
    pub fn read_exact_len(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut transferred = 0;

        while transferred < buf.len() {
            let res = match &mut self.inner {
                Inner::Reader(r) => r.read(&mut buf[transferred..]),
                Inner::Writer(_) => return Err(self.wrong_direction(transferred)),
                Inner::Closed => return Err(self.closed_error()),
            };

            match res {
                Ok(0) => {
                    return Err(self.io_error(
                        transferred,
                        io::Error::from(io::ErrorKind::UnexpectedEof),
                    ))
                }
                Ok(n) => transferred += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.io_error(transferred, e)),
            }
        }

        Ok(transferred)
    }

    /// Write all of `buf` into the stream's buffer (flushing to the pipe as it fills).
    ///
    /// Returns `buf.len()` on success; on failure the error carries how many bytes were accepted.
    /// Call [`flush()`](Write::flush) or [`close()`](Self::close) to push out the rest.
    pub fn write_all_len(&mut self, buf: &[u8]) -> Result<usize> {
        let mut transferred = 0;

        while transferred < buf.len() {
            let res = match &mut self.inner {
                Inner::Writer(w) => w.write(&buf[transferred..]),
                Inner::Reader(_) => return Err(self.wrong_direction(transferred)),
                Inner::Closed => return Err(self.closed_error()),
            };

            match res {
                Ok(0) => {
                    return Err(
                        self.io_error(transferred, io::Error::from(io::ErrorKind::WriteZero))
                    )
                }
                Ok(n) => transferred += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.io_error(transferred, e)),
            }
        }

        Ok(transferred)
    }

    /// Read until the child closes its end. Returns the number of bytes appended to `buf`.
    pub fn read_until_eof(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let start = buf.len();

        let res = match &mut self.inner {
            Inner::Reader(r) => r.read_to_end(buf),
            Inner::Writer(_) => return Err(self.wrong_direction(0)),
            Inner::Closed => return Err(self.closed_error()),
        };

        res.map_err(|e| self.io_error(buf.len() - start, e))
    }

    /// Flush and close the descriptor.
    ///
    /// If the flush fails, the error carries the number of buffered bytes that did reach the
    /// pipe.
    ///
    /// Closing a stream twice is reported as [`Error::StreamClosed`] and changes nothing else.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Reader(r) => {
                drop(r);
                Ok(())
            }
            Inner::Writer(mut w) => {
                let buffered = w.buffer().len();
                // The descriptor is closed even if the flush fails
                let res = w.flush();
                let flushed = buffered - w.buffer().len();
                drop(w.into_parts());
                res.map_err(|e| self.io_error(flushed, e))
            }
            Inner::Closed => Err(self.closed_error()),
        }
    }

    /// Take the descriptor out of the stream.
    ///
    /// Pending output is flushed first. Fails if input has been buffered but not yet read, since
    /// it would be lost.
    pub fn into_owned_fd(mut self) -> Result<OwnedFd> {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Reader(r) => {
                if !r.buffer().is_empty() {
                    self.inner = Inner::Reader(r);
                    return Err(Error::InvalidArgument("stream still holds unread input"));
                }
                Ok(OwnedFd::from(r.into_inner()))
            }
            Inner::Writer(w) => {
                let buffered = w.buffer().len();
                match w.into_inner() {
                    Ok(file) => Ok(OwnedFd::from(file)),
                    Err(e) => {
                        let source = io::Error::new(e.error().kind(), e.error().to_string());
                        let flushed = buffered - e.into_inner().buffer().len();
                        Err(self.io_error(flushed, source))
                    }
                }
            }
            Inner::Closed => Err(self.closed_error()),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("channel", &self.channel)
            .field("fd", &self.raw_fd())
            .finish()
    }
}

fn closed_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

fn unsupported_io_error() -> io::Error {
    io::Error::from(io::ErrorKind::Unsupported)
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Reader(r) => r.read(buf),
            Inner::Writer(_) => Err(unsupported_io_error()),
            Inner::Closed => Err(closed_io_error()),
        }
    }
}

impl BufRead for Stream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match &mut self.inner {
            Inner::Reader(r) => r.fill_buf(),
            Inner::Writer(_) => Err(unsupported_io_error()),
            Inner::Closed => Err(closed_io_error()),
        }
    }

    fn consume(&mut self, amt: usize) {
        if let Inner::Reader(r) = &mut self.inner {
            r.consume(amt);
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Writer(w) => w.write(buf),
            Inner::Reader(_) => Err(unsupported_io_error()),
            Inner::Closed => Err(closed_io_error()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::Writer(w) => w.flush(),
            Inner::Reader(_) => Ok(()),
            Inner::Closed => Err(closed_io_error()),
        }
    }
}

/// Streams handed out by [`Process::streams()`](crate::Process::streams).
#[derive(Debug, Default)]
pub struct Streams {
    pub stdin: Option<Stream>,
    pub stdout: Option<Stream>,
    pub stderr: Option<Stream>,
}

impl Streams {
    /// The channels present in this set.
    pub fn channels(&self) -> Channels {
        let mut set = Channels::empty();
        set.set(Channels::STDIN, self.stdin.is_some());
        set.set(Channels::STDOUT, self.stdout.is_some());
        set.set(Channels::STDERR, self.stderr.is_some());
        set
    }
}
