//! Line-framed pipe I/O for envelopes crossing a process boundary.
//!
//! Reads and writes retry on EINTR so signal delivery to a worker never
//! tears a frame.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use super::message::Message;
use crate::error::{GenError, Result};

/// Buffer size for pipe I/O (64KB); batches of a few hundred items fit in one read.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Owned pipe end with EINTR-safe `Read`/`Write`.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    /// `fd` must be open and not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    /// Create an anonymous pipe, returning `(read_end, write_end)`.
    pub fn pipe() -> io::Result<(Self, Self)> {
        let (read_fd, write_fd) =
            nix::unistd::pipe().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok((Self::new(read_fd), Self::new(write_fd)))
    }
}

impl From<OwnedFd> for PipeFd {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads newline-delimited frames from a pipe.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(PIPE_BUFFER_SIZE, fd),
            line: String::with_capacity(4096),
        }
    }

    /// Read one line without its terminator. `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        if self.line.ends_with('\n') {
            self.line.pop();
        }
        if self.line.ends_with('\r') {
            self.line.pop();
        }
        Ok(Some(&self.line))
    }

    /// Read the next envelope, skipping blank lines. `None` on EOF.
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.read_line()? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    return Message::from_line(line).map(Some).map_err(|e| {
                        GenError::Transport(format!("Invalid frame from peer: {}", e))
                    });
                }
            }
        }
    }
}

/// Writes newline-delimited frames to a pipe, flushing after every frame.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(PIPE_BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if missing) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    pub fn write_message(&mut self, message: &Message) -> Result<()> {
        let line = message.to_line()?;
        Ok(self.write_line(&line)?)
    }
}
