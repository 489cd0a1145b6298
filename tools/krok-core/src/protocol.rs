//! The sector protocol spoken by the Krokodile Cartridge firmware.
//!
//! Every command starts with `0x01` followed by a command number:
//!
//! | command | frame                                                   | reply                    |
//! |---------|---------------------------------------------------------|--------------------------|
//! | write   | `01 00 hi lo type <256 data> xor(hi..data)` (262 bytes)  | `FF` ok, `7C` bad sum    |
//! | verify  | `01 01 hi lo xor(hi,lo)`                                | `FE` ok, `00` bad sum, then 256 data + xor |
//! | version | `01 02`                                                 | ack, then a 0 terminated string |

use log::{debug, info, warn};

use crate::cart::{Cartridge, Transfer, TransferState, SECTOR_SIZE};
use crate::error::{KrokError, Result};
use crate::transport::SerialTransport;

pub const COMMAND_START: u8 = 0x01;
pub const CMD_WRITE_SECTOR: u8 = 0x00;
pub const CMD_READ_SECTOR: u8 = 0x01;
pub const CMD_VERSION: u8 = 0x02;

pub const WRITE_FRAME_LEN: usize = 5 + SECTOR_SIZE + 1;
pub const READ_REQUEST_LEN: usize = 5;
/// Sector data plus its checksum.
pub const READ_RESPONSE_LEN: usize = SECTOR_SIZE + 1;

pub const ACK_WRITE_OK: u8 = 0xFF;
pub const ACK_WRITE_CHECKSUM: u8 = 0x7C;
pub const ACK_READ_OK: u8 = 0xFE;
pub const ACK_READ_CHECKSUM: u8 = 0x00;
/// Sent by the host after a verify response or a version string arrived.
pub const ACK_RECEIPT: u8 = 0x01;

const VERSION_MAX_LEN: usize = 100;
const VERSION_MIN_LEN: usize = 10;

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

pub fn write_frame(sector: u16, type_code: u8, data: &[u8]) -> [u8; WRITE_FRAME_LEN] {
    let mut frame = [0u8; WRITE_FRAME_LEN];
    frame[0] = COMMAND_START;
    frame[1] = CMD_WRITE_SECTOR;
    frame[2..4].copy_from_slice(&sector.to_be_bytes());
    frame[4] = type_code;
    frame[5..5 + SECTOR_SIZE].copy_from_slice(&data[..SECTOR_SIZE]);
    frame[WRITE_FRAME_LEN - 1] = checksum(&frame[2..WRITE_FRAME_LEN - 1]);
    frame
}

pub fn read_request(sector: u16) -> [u8; READ_REQUEST_LEN] {
    let [hi, lo] = sector.to_be_bytes();
    [COMMAND_START, CMD_READ_SECTOR, hi, lo, hi ^ lo]
}

/// Snapshot of a running transfer for progress displays.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Progress {
    /// The sector just handled.
    pub sector: u16,
    pub done: u16,
    pub total: u16,
    /// False when an incremental write skipped an unchanged sector.
    pub transferred: bool,
}

enum Attempt {
    Ok,
    Retry(String),
}

impl Cartridge {
    /// Writes the sector under the cursor and advances it, returning the
    /// sector's index. In incremental mode unchanged sectors are skipped
    /// without touching the wire.
    pub fn write_next_sector<T: SerialTransport + ?Sized>(&mut self, transport: &mut T) -> Result<u16> {
        self.begin_step(Transfer::Write)?;
        let sector = self.current_sector;

        if self.config.incremental && !self.modified[sector as usize] {
            debug!("sector {} unchanged, skipping", sector);
            self.finish_step(Transfer::Write);
            return Ok(sector);
        }

        let frame = write_frame(sector, self.bs_type.wire_code(), self.sector_data(sector));
        self.run_attempts(Transfer::Write, sector, |_| write_attempt(transport, &frame))?;

        self.transmitted += 1;
        self.finish_step(Transfer::Write);
        Ok(sector)
    }

    /// Reads the sector under the cursor back from the cart and compares it
    /// with the image. A mismatch is retried like a transport error.
    pub fn verify_next_sector<T: SerialTransport + ?Sized>(&mut self, transport: &mut T) -> Result<u16> {
        self.begin_step(Transfer::Verify)?;
        let sector = self.current_sector;

        let start = sector as usize * SECTOR_SIZE;
        let expected = self.data[start..start + SECTOR_SIZE].to_vec();
        self.run_attempts(Transfer::Verify, sector, |_| verify_attempt(transport, sector, &expected))?;

        self.transmitted += 1;
        self.finish_step(Transfer::Verify);
        Ok(sector)
    }

    /// Closes a write session. True if every sector made it, in which case
    /// the image becomes the baseline for the next incremental download.
    pub fn finalize_sectors(&mut self) -> bool {
        let done = self.valid && self.num_sectors > 0 && self.processed == self.num_sectors;
        if !done {
            self.message = format!("Download failure on sector {}.", self.current_sector);
            self.state = TransferState::Failed(Transfer::Write);
            warn!("{}", self.message);
            return false;
        }

        if let Err(e) = self.write_last_image() {
            warn!("could not save the last written image: {}", e);
        }
        self.message = if self.config.incremental {
            format!("{} of {} sectors written.", self.transmitted, self.num_sectors)
        } else {
            format!("{} sectors written.", self.num_sectors)
        };
        self.state = TransferState::Complete(Transfer::Write);
        info!("{}", self.message);
        true
    }

    /// Closes a verify session.
    pub fn finalize_verify(&mut self) -> bool {
        let done = self.valid && self.num_sectors > 0 && self.processed == self.num_sectors;
        self.message = if done {
            self.state = TransferState::Complete(Transfer::Verify);
            format!("Verified download of {} sectors.", self.num_sectors)
        } else {
            self.state = TransferState::Failed(Transfer::Verify);
            format!("Verify failure on sector {}.", self.current_sector)
        };
        info!("{}", self.message);
        done
    }

    /// Enumerates, writes every sector and finalizes, reporting each step.
    pub fn write_all<T, F>(&mut self, transport: &mut T, mut progress: F) -> Result<u16>
    where
        T: SerialTransport + ?Sized,
        F: FnMut(Progress),
    {
        let total = self.enumerate_sectors(true);
        if !self.valid {
            return Err(KrokError::InvalidCartridge);
        }
        for done in 1..=total {
            let before = self.transmitted;
            let sector = self.write_next_sector(transport)?;
            progress(Progress {
                sector,
                done,
                total,
                transferred: self.transmitted != before,
            });
        }
        self.finalize_sectors();
        Ok(self.transmitted)
    }

    /// Enumerates, verifies every sector and finalizes, reporting each step.
    pub fn verify_all<T, F>(&mut self, transport: &mut T, mut progress: F) -> Result<u16>
    where
        T: SerialTransport + ?Sized,
        F: FnMut(Progress),
    {
        let total = self.enumerate_sectors(false);
        if !self.valid {
            return Err(KrokError::InvalidCartridge);
        }
        for done in 1..=total {
            let sector = self.verify_next_sector(transport)?;
            progress(Progress {
                sector,
                done,
                total,
                transferred: true,
            });
        }
        self.finalize_verify();
        Ok(total)
    }

    fn begin_step(&mut self, transfer: Transfer) -> Result<()> {
        if !self.valid {
            return Err(KrokError::InvalidCartridge);
        }
        match self.state {
            TransferState::InProgress(t) | TransferState::Failed(t) | TransferState::Complete(t) if t != transfer => {
                return Err(KrokError::SessionMismatch)
            }
            TransferState::Failed(_) => self.state = TransferState::InProgress(transfer),
            _ => {}
        }
        if self.processed >= self.num_sectors || self.state != TransferState::InProgress(transfer) {
            return Err(KrokError::SectorsExhausted);
        }
        Ok(())
    }

    fn finish_step(&mut self, transfer: Transfer) {
        self.advance();
        if self.processed == self.num_sectors {
            self.state = TransferState::Complete(transfer);
        }
    }

    /// Runs `attempt` up to `retry + 1` times. Transport errors are not
    /// retried; they abort the session straight away.
    fn run_attempts<F>(&mut self, transfer: Transfer, sector: u16, mut attempt: F) -> Result<()>
    where
        F: FnMut(u32) -> std::io::Result<Attempt>,
    {
        let attempts = self.config.retry + 1;
        for n in 1..=attempts {
            match attempt(n) {
                Ok(Attempt::Ok) => return Ok(()),
                Ok(Attempt::Retry(reason)) => {
                    warn!("sector {}: {} (attempt {} of {})", sector, reason, n, attempts);
                }
                Err(e) => {
                    self.fail(transfer, sector);
                    return Err(KrokError::TransportIO(e));
                }
            }
        }
        self.fail(transfer, sector);
        Err(KrokError::MaxRetriesExceeded { sector, attempts })
    }

    fn fail(&mut self, transfer: Transfer, sector: u16) {
        self.state = TransferState::Failed(transfer);
        self.message = match transfer {
            Transfer::Write => format!("Download failure on sector {}.", sector),
            Transfer::Verify => format!("Verify failure on sector {}.", sector),
        };
    }
}

fn write_attempt<T: SerialTransport + ?Sized>(transport: &mut T, frame: &[u8]) -> std::io::Result<Attempt> {
    let sent = transport.send(frame)?;
    if sent != frame.len() {
        return Ok(Attempt::Retry(format!("only {} of {} bytes sent", sent, frame.len())));
    }
    debug!("sent sector {:02X}{:02X}", frame[2], frame[3]);

    Ok(match transport.wait_for_ack()? {
        Some(ACK_WRITE_OK) => Attempt::Ok,
        Some(ACK_WRITE_CHECKSUM) => Attempt::Retry("checksum error".into()),
        Some(other) => Attempt::Retry(format!("unexpected reply {:#04X}", other)),
        None => Attempt::Retry("no reply".into()),
    })
}

fn verify_attempt<T: SerialTransport + ?Sized>(
    transport: &mut T,
    sector: u16,
    expected: &[u8],
) -> std::io::Result<Attempt> {
    let request = read_request(sector);
    let sent = transport.send(&request)?;
    if sent != request.len() {
        return Ok(Attempt::Retry(format!("only {} of {} bytes sent", sent, request.len())));
    }

    match transport.wait_for_ack()? {
        Some(ACK_READ_OK) => {}
        Some(ACK_READ_CHECKSUM) => return Ok(Attempt::Retry("request checksum error".into())),
        Some(other) => return Ok(Attempt::Retry(format!("unexpected reply {:#04X}", other))),
        None => return Ok(Attempt::Retry("no reply".into())),
    }

    let mut response = [0u8; READ_RESPONSE_LEN];
    let received = transport.receive_exact(&mut response)?;
    if received != READ_RESPONSE_LEN {
        return Ok(Attempt::Retry(format!("only {} of {} bytes received", received, READ_RESPONSE_LEN)));
    }
    let (data, sum) = response.split_at(SECTOR_SIZE);
    if checksum(data) != sum[0] {
        return Ok(Attempt::Retry("response checksum error".into()));
    }
    transport.send(&[ACK_RECEIPT])?;

    if data != expected {
        return Ok(Attempt::Retry("content differs".into()));
    }
    debug!("verified sector {}", sector);
    Ok(Attempt::Ok)
}

/// Asks the device on `transport` to identify itself. `None` means whatever
/// is on the other end is not a Krokodile Cartridge.
pub fn query_version<T: SerialTransport + ?Sized>(transport: &mut T) -> std::io::Result<Option<String>> {
    if transport.send(&[COMMAND_START, CMD_VERSION])? != 2 {
        return Ok(None);
    }
    if transport.wait_for_ack()?.is_none() {
        debug!("no ack for the version request");
    }

    let mut version = Vec::with_capacity(VERSION_MAX_LEN);
    while version.len() < VERSION_MAX_LEN {
        match transport.wait_for_ack()? {
            Some(byte) => {
                version.push(byte);
                if byte == 0 {
                    break;
                }
            }
            None => break,
        }
    }
    if version.len() > VERSION_MIN_LEN {
        transport.send(&[ACK_RECEIPT])?;
    }

    if version.len() <= VERSION_MIN_LEN || version[0] == 0 {
        return Ok(None);
    }
    let end = version.iter().position(|&b| b == 0).unwrap_or(version.len());
    Ok(Some(String::from_utf8_lossy(&version[..end]).trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_frame_layout() {
        let data: Vec<u8> = (0..=255).collect();
        let frame = write_frame(0x0102, 2, &data);
        assert_eq!(frame.len(), 262);
        assert_eq!(&frame[..5], &[0x01, 0x00, 0x01, 0x02, 0x02]);
        assert_eq!(&frame[5..261], &data[..]);
        // the data xors to zero, leaving hi ^ lo ^ type
        assert_eq!(frame[261], 0x01 ^ 0x02 ^ 0x02);
    }

    #[test]
    fn read_request_layout() {
        assert_eq!(read_request(2040), [0x01, 0x01, 0x07, 0xF8, 0x07 ^ 0xF8]);
        assert_eq!(read_request(0), [0x01, 0x01, 0, 0, 0]);
    }

    #[test]
    fn checksum_is_xor() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xAA, 0x55]), 0xFF);
        assert_eq!(checksum(&[0x12, 0x12]), 0);
    }
}
