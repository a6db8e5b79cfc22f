use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use crate::Error;
use crate::error::ErrorKind;

/// How long a read spins between attempts on a drained descriptor.
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// A point in time after which a read gives up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline the given duration from now.
    #[inline]
    pub fn after(duration: Duration) -> Self {
        Self(Some(Instant::now() + duration))
    }

    /// A deadline which never expires.
    #[inline]
    pub const fn none() -> Self {
        Self(None)
    }

    /// Test if the deadline has passed.
    #[inline]
    pub fn expired(&self) -> bool {
        match self.0 {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }
}

/// A byte channel over a pair of raw descriptors, framed as fixed-size
/// scalars and NUL-terminated strings.
///
/// Integers travel in native byte order. Both peers of every channel live on
/// the same machine, so no swapping layer is involved.
#[derive(Debug)]
pub struct Channel {
    read: OwnedFd,
    write: OwnedFd,
}

impl Channel {
    /// Construct a channel from a read and a write descriptor.
    #[inline]
    pub fn new(read: OwnedFd, write: OwnedFd) -> Self {
        Self { read, write }
    }

    /// Construct a channel over the process standard streams.
    ///
    /// The descriptors are duplicated, so dropping the channel does not close
    /// the real stdin and stdout.
    pub fn stdio() -> io::Result<Self> {
        // SAFETY: We're just using c-apis as intended.
        unsafe {
            let read = libc::dup(libc::STDIN_FILENO);

            if read == -1 {
                return Err(io::Error::last_os_error());
            }

            let read = OwnedFd::from_raw_fd(read);
            let write = libc::dup(libc::STDOUT_FILENO);

            if write == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(Self {
                read,
                write: OwnedFd::from_raw_fd(write),
            })
        }
    }

    /// Construct a connected pair of channels over two anonymous pipes.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a_read, b_write) = pipe()?;
        let (b_read, a_write) = pipe()?;

        let a = Self {
            read: a_read,
            write: a_write,
        };

        let b = Self {
            read: b_read,
            write: b_write,
        };

        Ok((a, b))
    }

    /// Switch the read side of the channel in or out of non-blocking mode.
    ///
    /// Deadline reads work in either mode; non-blocking is required when the
    /// caller probes with short deadlines and must not park in the kernel.
    pub fn set_read_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        // SAFETY: We're just using c-apis as intended.
        unsafe {
            let mut flags = libc::fcntl(self.read.as_raw_fd(), libc::F_GETFL);

            if flags == -1 {
                return Err(io::Error::last_os_error());
            }

            if nonblocking {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }

            if libc::fcntl(self.read.as_raw_fd(), libc::F_SETFL, flags) == -1 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }
    }

    /// Write all of the given bytes to the channel.
    pub fn write_all(&mut self, mut bytes: &[u8]) -> Result<(), Error> {
        while !bytes.is_empty() {
            // SAFETY: The pointer and length denote the live remainder of the
            // input slice.
            let n = unsafe {
                libc::write(
                    self.write.as_raw_fd(),
                    bytes.as_ptr().cast(),
                    bytes.len(),
                )
            };

            if n == -1 {
                match io::Error::last_os_error() {
                    e if e.kind() == io::ErrorKind::Interrupted => continue,
                    e if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(POLL_INTERVAL);
                        continue;
                    }
                    e if e.kind() == io::ErrorKind::BrokenPipe => {
                        return Err(Error::new(ErrorKind::Closed));
                    }
                    e => return Err(Error::from(e)),
                }
            }

            bytes = &bytes[n as usize..];
        }

        Ok(())
    }

    /// Read exactly `buf.len()` bytes, giving up at the deadline.
    ///
    /// A drained descriptor is retried on a sub-tick interval until the
    /// deadline expires, which reports `TimedOut`. A peer hangup reports
    /// `Closed`.
    pub fn read_exact(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<(), Error> {
        let mut at = 0;

        while at < buf.len() {
            // SAFETY: The pointer and length denote the unfilled remainder of
            // the output buffer.
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf[at..].as_mut_ptr().cast(),
                    buf.len() - at,
                )
            };

            match n {
                0 => return Err(Error::new(ErrorKind::Closed)),
                -1 => match io::Error::last_os_error() {
                    e if e.kind() == io::ErrorKind::Interrupted => continue,
                    e if e.kind() == io::ErrorKind::WouldBlock => {
                        if deadline.expired() {
                            return Err(Error::new(ErrorKind::TimedOut));
                        }

                        thread::sleep(POLL_INTERVAL);
                    }
                    e => return Err(Error::from(e)),
                },
                n => at += n as usize,
            }
        }

        Ok(())
    }

    /// Write a string as its bytes followed by a single NUL.
    pub fn write_cstr(&mut self, s: &str) -> Result<(), Error> {
        if s.as_bytes().contains(&0) {
            return Err(Error::new(ErrorKind::MalformedString));
        }

        self.write_all(s.as_bytes())?;
        self.write_all(&[0])
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    ///
    /// Reaching `max` before the terminator means the frame is malformed and
    /// is reported as an error.
    pub fn read_cstr(&mut self, max: usize, deadline: Deadline) -> Result<String, Error> {
        let mut bytes = Vec::new();
        let mut byte = [0u8];

        loop {
            self.read_exact(&mut byte, deadline)?;

            if byte[0] == 0 {
                break;
            }

            if bytes.len() == max {
                return Err(Error::new(ErrorKind::MalformedString));
            }

            bytes.push(byte[0]);
        }

        match String::from_utf8(bytes) {
            Ok(s) => Ok(s),
            Err(..) => Err(Error::new(ErrorKind::MalformedString)),
        }
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) -> Result<(), Error> {
        self.write_all(&[value])
    }

    #[inline]
    pub fn write_u16(&mut self, value: u16) -> Result<(), Error> {
        self.write_all(&value.to_ne_bytes())
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        self.write_all(&value.to_ne_bytes())
    }

    #[inline]
    pub fn write_i32(&mut self, value: i32) -> Result<(), Error> {
        self.write_all(&value.to_ne_bytes())
    }

    #[inline]
    pub fn write_i64(&mut self, value: i64) -> Result<(), Error> {
        self.write_all(&value.to_ne_bytes())
    }

    #[inline]
    pub fn read_u8(&mut self, deadline: Deadline) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf, deadline)?;
        Ok(buf[0])
    }

    #[inline]
    pub fn read_u16(&mut self, deadline: Deadline) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf, deadline)?;
        Ok(u16::from_ne_bytes(buf))
    }

    #[inline]
    pub fn read_u32(&mut self, deadline: Deadline) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, deadline)?;
        Ok(u32::from_ne_bytes(buf))
    }

    #[inline]
    pub fn read_i32(&mut self, deadline: Deadline) -> Result<i32, Error> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, deadline)?;
        Ok(i32::from_ne_bytes(buf))
    }

    #[inline]
    pub fn read_i64(&mut self, deadline: Deadline) -> Result<i64, Error> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf, deadline)?;
        Ok(i64::from_ne_bytes(buf))
    }
}

impl AsRawFd for Channel {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    // SAFETY: We're just using c-apis as intended. Close-on-exec keeps the
    // pair from leaking into spawned workers.
    unsafe {
        let mut fds = [0i32; 2];

        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Channel, Deadline};
    use crate::Error;

    #[test]
    fn scalar_round_trip() -> Result<(), Error> {
        let (mut a, mut b) = Channel::pair()?;

        a.write_u16(0x1234)?;
        a.write_i32(-7)?;
        a.write_i64(1 << 40)?;

        assert_eq!(b.read_u16(Deadline::none())?, 0x1234);
        assert_eq!(b.read_i32(Deadline::none())?, -7);
        assert_eq!(b.read_i64(Deadline::none())?, 1 << 40);
        Ok(())
    }

    #[test]
    fn cstr_round_trip() -> Result<(), Error> {
        let (mut a, mut b) = Channel::pair()?;

        a.write_cstr("position")?;
        a.write_cstr("")?;

        assert_eq!(b.read_cstr(64, Deadline::none())?, "position");
        assert_eq!(b.read_cstr(64, Deadline::none())?, "");
        Ok(())
    }

    #[test]
    fn cstr_over_max_is_malformed() -> Result<(), Error> {
        let (mut a, mut b) = Channel::pair()?;

        a.write_cstr("overlong")?;

        let err = b.read_cstr(4, Deadline::none()).unwrap_err();
        assert!(!err.is_timed_out());
        assert!(!err.is_closed());
        Ok(())
    }

    #[test]
    fn read_times_out_on_silence() -> Result<(), Error> {
        let (_a, mut b) = Channel::pair()?;

        b.set_read_nonblocking(true)?;

        let err = b
            .read_u32(Deadline::after(Duration::from_millis(5)))
            .unwrap_err();
        assert!(err.is_timed_out());
        Ok(())
    }

    #[test]
    fn read_reports_closed_on_hangup() -> Result<(), Error> {
        let (a, mut b) = Channel::pair()?;

        drop(a);

        let err = b.read_u32(Deadline::none()).unwrap_err();
        assert!(err.is_closed());
        Ok(())
    }
}
