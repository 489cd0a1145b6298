#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::path::Path;

use krok_core::protocol::{checksum, ACK_READ_OK, ACK_RECEIPT, ACK_WRITE_CHECKSUM, ACK_WRITE_OK};
use krok_core::SerialTransport;

/// An in-memory Krokodile Cartridge. Decodes the frames it is sent, keeps
/// the sectors it was given and answers like the firmware does.
#[derive(Default)]
pub struct FakeKrok {
    pub sectors: HashMap<u16, Vec<u8>>,
    pub types: HashMap<u16, u8>,
    /// Sector numbers in the order write frames arrived.
    pub writes: Vec<u16>,
    pub reads: Vec<u16>,
    pub receipts: usize,
    pub version: String,
    /// Answer the next n write frames with a checksum error.
    pub bad_writes: u32,
    /// Ignore the next n frames entirely.
    pub silent: u32,
    /// Flip a data bit in the next n verify responses.
    pub corrupt_reads: u32,
    /// Fail every send and receive as if the cable was pulled.
    pub unplugged: bool,
    replies: VecDeque<u8>,
}

impl FakeKrok {
    pub fn new() -> Self {
        Self {
            version: "KrokCart v1.02".into(),
            ..Default::default()
        }
    }

    fn handle(&mut self, frame: &[u8]) {
        if self.silent > 0 {
            self.silent -= 1;
            return;
        }
        match frame {
            [1, 0, hi, lo, code, rest @ ..] if rest.len() == 257 => {
                let sector = u16::from_be_bytes([*hi, *lo]);
                self.writes.push(sector);
                let sum_ok = checksum(&frame[2..261]) == frame[261];
                if self.bad_writes > 0 || !sum_ok {
                    self.bad_writes = self.bad_writes.saturating_sub(1);
                    self.replies.push_back(ACK_WRITE_CHECKSUM);
                    return;
                }
                self.sectors.insert(sector, rest[..256].to_vec());
                self.types.insert(sector, *code);
                self.replies.push_back(ACK_WRITE_OK);
            }
            [1, 1, hi, lo, sum] => {
                assert_eq!(hi ^ lo, *sum, "read request checksum");
                let sector = u16::from_be_bytes([*hi, *lo]);
                self.reads.push(sector);
                let mut data = self.sectors.get(&sector).cloned().unwrap_or_else(|| vec![0xFF; 256]);
                let sum = checksum(&data);
                if self.corrupt_reads > 0 {
                    self.corrupt_reads -= 1;
                    data[17] ^= 0x01;
                }
                self.replies.push_back(ACK_READ_OK);
                self.replies.extend(data);
                self.replies.push_back(sum);
            }
            [1, 2] => {
                self.replies.push_back(ACK_WRITE_OK);
                self.replies.extend(self.version.bytes());
                self.replies.push_back(0);
            }
            [b] if *b == ACK_RECEIPT => self.receipts += 1,
            other => panic!("unexpected frame of {} bytes", other.len()),
        }
    }

    /// Everything written so far laid out as a flash image.
    pub fn flash(&self) -> Vec<u8> {
        let mut flash = vec![0u8; krok_core::MAX_CART_SIZE];
        for (sector, data) in &self.sectors {
            let start = *sector as usize * 256;
            flash[start..start + 256].copy_from_slice(data);
        }
        flash
    }
}

impl SerialTransport for FakeKrok {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        self.handle(data);
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        let n = buf.len().min(self.replies.len());
        for (slot, byte) in buf.iter_mut().zip(self.replies.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn sleep(&mut self, _ms: u64) {}
}

/// Bytes 1..=7 in a pattern that matches no signature and no superchip.
pub fn plain(size: usize) -> Vec<u8> {
    (0..size).map(|i| ((i % 251 + i / 4096) % 7 + 1) as u8).collect()
}

pub fn write_rom(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    path
}
