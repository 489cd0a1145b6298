//! The byte pipe to a Krokodile Cartridge.
//!
//! Platform backends (a real serial port, a test double) implement
//! [`SerialTransport`]; the protocol only ever sees this trait.

use std::io;
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::error::{KrokError, Result};

/// Number of empty reads tolerated while waiting for a reply byte.
pub const ACK_POLL_ATTEMPTS: u32 = 100;
/// Pause between two empty reads.
pub const ACK_POLL_INTERVAL_MS: u64 = 1;

pub trait SerialTransport {
    /// Writes `data`, returning how many bytes went out.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Reads whatever is available into `buf`, returning the count.
    /// Zero means nothing arrived in time; it is not an error.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn sleep(&mut self, ms: u64);

    /// Polls for a single reply byte. `None` if the device stayed silent.
    fn wait_for_ack(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        for _ in 0..ACK_POLL_ATTEMPTS {
            if self.receive(&mut byte)? == 1 {
                return Ok(Some(byte[0]));
            }
            self.sleep(ACK_POLL_INTERVAL_MS);
        }
        Ok(None)
    }

    /// Fills `buf` completely, polling like [`wait_for_ack`](Self::wait_for_ack)
    /// whenever the device pauses. Returns the number of bytes actually read.
    fn receive_exact(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        let mut idle = 0;
        while filled < buf.len() && idle < ACK_POLL_ATTEMPTS {
            match self.receive(&mut buf[filled..])? {
                0 => {
                    idle += 1;
                    self.sleep(ACK_POLL_INTERVAL_MS);
                }
                n => {
                    filled += n;
                    idle = 0;
                }
            }
        }
        Ok(filled)
    }
}

impl<T: SerialTransport + ?Sized> SerialTransport for &mut T {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).send(data)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).receive(buf)
    }

    fn sleep(&mut self, ms: u64) {
        (**self).sleep(ms)
    }
}

impl<T: SerialTransport + ?Sized> SerialTransport for Box<T> {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).send(data)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).receive(buf)
    }

    fn sleep(&mut self, ms: u64) {
        (**self).sleep(ms)
    }
}

/// Owns a transport and hands it out to one transfer at a time.
///
/// A second [`session`](Self::session) while the first guard is alive fails
/// with [`KrokError::Busy`] instead of interleaving frames on the wire.
#[derive(Debug)]
pub struct SharedTransport<T> {
    inner: Mutex<T>,
}

impl<T: SerialTransport> SharedTransport<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Mutex::new(transport),
        }
    }

    pub fn session(&self) -> Result<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(KrokError::Busy),
            // a transfer that panicked mid-frame still hands the port back
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replies with `pending`, handing out at most `chunk` bytes per read
    /// and going quiet for `gaps` reads in between.
    struct Trickle {
        pending: VecDeque<u8>,
        chunk: usize,
        gaps: u32,
        quiet: u32,
        slept: u64,
    }

    impl SerialTransport for Trickle {
        fn send(&mut self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }

        fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.quiet < self.gaps {
                self.quiet += 1;
                return Ok(0);
            }
            self.quiet = 0;
            let n = buf.len().min(self.chunk).min(self.pending.len());
            for b in buf.iter_mut().take(n) {
                *b = self.pending.pop_front().unwrap();
            }
            Ok(n)
        }

        fn sleep(&mut self, ms: u64) {
            self.slept += ms;
        }
    }

    fn trickle(bytes: &[u8], chunk: usize, gaps: u32) -> Trickle {
        Trickle {
            pending: bytes.iter().copied().collect(),
            chunk,
            gaps,
            quiet: 0,
            slept: 0,
        }
    }

    #[test]
    fn ack_after_a_pause() {
        let mut t = trickle(&[0xFF], 1, 5);
        assert_eq!(t.wait_for_ack().unwrap(), Some(0xFF));
        assert_eq!(t.slept, 5);
    }

    #[test]
    fn silence_is_no_ack() {
        let mut t = trickle(&[], 1, 0);
        assert_eq!(t.wait_for_ack().unwrap(), None);
        assert_eq!(t.slept, ACK_POLL_ATTEMPTS as u64);
    }

    #[test]
    fn receive_exact_gathers_chunks() {
        let data: Vec<u8> = (0..=255).collect();
        let mut t = trickle(&data, 7, 2);
        let mut buf = [0u8; 256];
        assert_eq!(t.receive_exact(&mut buf).unwrap(), 256);
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn receive_exact_reports_short_reads() {
        let mut t = trickle(&[1, 2, 3], 3, 0);
        let mut buf = [0u8; 8];
        assert_eq!(t.receive_exact(&mut buf).unwrap(), 3);
    }

    #[test]
    fn second_session_is_busy() {
        let shared = SharedTransport::new(trickle(&[], 1, 0));
        let first = shared.session().unwrap();
        assert!(matches!(shared.session(), Err(KrokError::Busy)));
        drop(first);
        assert!(shared.session().is_ok());
    }
}
