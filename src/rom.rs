//! Cartridge image assembly
//!
//! Builds iNES images for mapper 0 (NROM): a 16-byte header followed by
//! one PRG bank whose last six bytes hold the NMI, RESET and IRQ vectors,
//! then any CHR banks.
//!
//! Startup routines are spliced into the first run of zero bytes in the
//! bank that can hold them, and the reset vector is repointed there. The
//! routine ends with a jump to the original reset handler.
//!
//! # Usage
//!
//! ```ignore
//! let bank = layout_bank(&output.main, output.vectors, PrgSize::Nrom256)?;
//! let rom = assemble(Header::new(PrgSize::Nrom256), bank, &output.startup)?;
//! rom.write_to(&mut file)?;
//! ```

use std::io::{self, Write};

use log::{debug, info};
use thiserror::Error;

use crate::codegen::{Segment, Vectors};

/// iNES signature
pub const MAGIC: [u8; 4] = *b"NES\x1A";
pub const HEADER_LEN: usize = 16;
pub const PRG_BANK_SIZE: usize = 0x4000;
pub const CHR_BANK_SIZE: usize = 0x2000;

const NMI_OFFSET_FROM_END: usize = 6;
const RESET_OFFSET_FROM_END: usize = 4;
const IRQ_OFFSET_FROM_END: usize = 2;

/// JMP absolute
const JMP_ABS: u8 = 0x4C;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RomError {
    #[error("no space for startup routine of {0} bytes")]
    NoSpaceForStartup(usize),
    #[error("program is {len} bytes, bank has room for {capacity}")]
    ProgramTooLarge { len: usize, capacity: usize },
    #[error("segment at ${origin:04X} lies outside the bank at ${base:04X}")]
    SegmentOutsideBank { origin: u16, base: u16 },
    #[error("expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("missing iNES signature")]
    BadMagic,
    #[error("file too short for header: {0} bytes")]
    Truncated(usize),
    #[error("unsupported PRG bank count {0}")]
    UnsupportedBanks(u8),
}

/// NROM PRG layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrgSize {
    /// 16 KiB at `$C000` (mirrored at `$8000`)
    Nrom128,
    /// 32 KiB at `$8000`
    #[default]
    Nrom256,
}

impl PrgSize {
    pub fn bank_size(self) -> usize {
        self.banks() as usize * PRG_BANK_SIZE
    }

    /// Where the bank appears in CPU address space
    pub fn base_address(self) -> u16 {
        match self {
            PrgSize::Nrom128 => 0xC000,
            PrgSize::Nrom256 => 0x8000,
        }
    }

    /// PRG size in 16 KiB units
    pub fn banks(self) -> u8 {
        match self {
            PrgSize::Nrom128 => 1,
            PrgSize::Nrom256 => 2,
        }
    }

    pub fn from_banks(banks: u8) -> Result<Self, RomError> {
        match banks {
            1 => Ok(PrgSize::Nrom128),
            2 => Ok(PrgSize::Nrom256),
            n => Err(RomError::UnsupportedBanks(n)),
        }
    }
}

/// Nametable mirroring (flags 6, bit 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mirroring {
    #[default]
    Horizontal,
    Vertical,
}

/// iNES 1.0 header
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    /// PRG ROM size in 16 KiB units
    pub prg_banks: u8,
    /// CHR ROM size in 8 KiB units, 0 for CHR RAM
    pub chr_banks: u8,
    pub mirroring: Mirroring,
    pub battery: bool,
    pub trainer: bool,
    pub four_screen: bool,
    pub mapper: u8,
    pub vs_unisystem: bool,
    /// PRG RAM size in 8 KiB units
    pub prg_ram_size: u8,
    pub pal: bool,
    /// Byte 10, unofficial TV system / PRG RAM / bus conflict bits
    pub flags10: u8,
}

impl Header {
    /// Mapper 0 header for `prg`, everything else zero
    pub fn new(prg: PrgSize) -> Self {
        Header { prg_banks: prg.banks(), ..Default::default() }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(&MAGIC);
        bytes[4] = self.prg_banks;
        bytes[5] = self.chr_banks;
        bytes[6] = (self.mirroring == Mirroring::Vertical) as u8
            | (self.battery as u8) << 1
            | (self.trainer as u8) << 2
            | (self.four_screen as u8) << 3
            | (self.mapper & 0x0F) << 4;
        bytes[7] = self.vs_unisystem as u8 | (self.mapper & 0xF0);
        bytes[8] = self.prg_ram_size;
        bytes[9] = self.pal as u8;
        bytes[10] = self.flags10;
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, RomError> {
        if bytes.len() < HEADER_LEN {
            return Err(RomError::Truncated(bytes.len()));
        }
        if bytes[..4] != MAGIC {
            return Err(RomError::BadMagic);
        }
        let flags6 = bytes[6];
        let flags7 = bytes[7];
        Ok(Header {
            prg_banks: bytes[4],
            chr_banks: bytes[5],
            mirroring: if flags6 & 0x01 != 0 { Mirroring::Vertical } else { Mirroring::Horizontal },
            battery: flags6 & 0x02 != 0,
            trainer: flags6 & 0x04 != 0,
            four_screen: flags6 & 0x08 != 0,
            mapper: (flags6 >> 4) | (flags7 & 0xF0),
            vs_unisystem: flags7 & 0x01 != 0,
            prg_ram_size: bytes[8],
            pal: bytes[9] & 0x01 != 0,
            flags10: bytes[10],
        })
    }

    pub fn prg_len(&self) -> usize {
        self.prg_banks as usize * PRG_BANK_SIZE
    }

    pub fn chr_len(&self) -> usize {
        self.chr_banks as usize * CHR_BANK_SIZE
    }
}

/// A complete cartridge image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rom {
    pub header: Header,
    pub prg: Vec<u8>,
    pub chr: Vec<u8>,
}

impl Rom {
    /// Pair a header with its payload; sizes must agree.
    /// CHR banks declared by the header are zero-filled.
    pub fn new(header: Header, prg: Vec<u8>) -> Result<Self, RomError> {
        if prg.len() != header.prg_len() {
            return Err(RomError::SizeMismatch { expected: header.prg_len(), actual: prg.len() });
        }
        let chr = vec![0; header.chr_len()];
        Ok(Rom { header, prg, chr })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RomError> {
        let header = Header::parse(bytes)?;
        let expected = HEADER_LEN + header.prg_len() + header.chr_len();
        if bytes.len() != expected {
            return Err(RomError::SizeMismatch { expected, actual: bytes.len() });
        }
        let prg_end = HEADER_LEN + header.prg_len();
        Ok(Rom {
            prg: bytes[HEADER_LEN..prg_end].to_vec(),
            chr: bytes[prg_end..].to_vec(),
            header,
        })
    }

    pub fn vectors(&self) -> Vectors {
        Vectors {
            nmi: read_vector(&self.prg, NMI_OFFSET_FROM_END),
            reset: read_vector(&self.prg, RESET_OFFSET_FROM_END),
            irq: read_vector(&self.prg, IRQ_OFFSET_FROM_END),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.prg.len() + self.chr.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.prg);
        out.extend_from_slice(&self.chr);
        out
    }

    /// Header, then PRG, then CHR, no padding
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        sink.write_all(&self.header.to_bytes())?;
        sink.write_all(&self.prg)?;
        sink.write_all(&self.chr)
    }
}

fn read_vector(bank: &[u8], offset_from_end: usize) -> u16 {
    let at = bank.len() - offset_from_end;
    u16::from_le_bytes([bank[at], bank[at + 1]])
}

fn write_vector(bank: &mut [u8], offset_from_end: usize, addr: u16) {
    let at = bank.len() - offset_from_end;
    bank[at..at + 2].copy_from_slice(&addr.to_le_bytes());
}

/// Place the main segment in a zero-filled bank and write the vectors
pub fn layout_bank(main: &Segment, vectors: Vectors, prg: PrgSize) -> Result<Vec<u8>, RomError> {
    let base = prg.base_address();
    let size = prg.bank_size();
    let capacity = size - NMI_OFFSET_FROM_END;
    if main.origin < base {
        return Err(RomError::SegmentOutsideBank { origin: main.origin, base });
    }
    let start = (main.origin - base) as usize;
    if start + main.len() > capacity {
        return Err(RomError::ProgramTooLarge { len: start + main.len(), capacity });
    }

    let mut bank = vec![0u8; size];
    bank[start..start + main.len()].copy_from_slice(&main.bytes);
    write_vector(&mut bank, NMI_OFFSET_FROM_END, vectors.nmi);
    write_vector(&mut bank, RESET_OFFSET_FROM_END, vectors.reset);
    write_vector(&mut bank, IRQ_OFFSET_FROM_END, vectors.irq);
    debug!("bank laid out: {} of {} bytes used", start + main.len(), capacity);
    Ok(bank)
}

/// First offset `i` where `bank[i..i + len]` is all zero
pub fn find_zero_window(bank: &[u8], len: usize) -> Option<usize> {
    if len == 0 || len > bank.len() {
        return None;
    }
    let mut run = 0;
    for (i, &byte) in bank.iter().enumerate() {
        if byte == 0 {
            run += 1;
            if run == len {
                return Some(i + 1 - len);
            }
        } else {
            run = 0;
        }
    }
    None
}

/// Build the image from a full PRG bank and an optional startup routine.
///
/// The bank is copied verbatim. A non-empty startup segment gets a
/// trailing `JMP` to the original reset vector, is placed in the first
/// zero window that fits, and becomes the new reset target.
pub fn assemble(header: Header, main_bank: Vec<u8>, startup: &Segment) -> Result<Rom, RomError> {
    let mut rom = Rom::new(header, main_bank)?;
    if startup.is_empty() {
        info!("assembled ROM without startup routine");
        return Ok(rom);
    }

    let prg = PrgSize::from_banks(rom.header.prg_banks)?;
    let original_reset = read_vector(&rom.prg, RESET_OFFSET_FROM_END);
    let len = startup.len() + 3;
    let offset = find_zero_window(&rom.prg, len).ok_or(RomError::NoSpaceForStartup(len))?;
    let load_addr = prg.base_address() + offset as u16;

    let mut routine = startup.clone();
    routine.rebase(load_addr);
    routine.bytes.push(JMP_ABS);
    routine.bytes.extend_from_slice(&original_reset.to_le_bytes());

    rom.prg[offset..offset + len].copy_from_slice(&routine.bytes);
    write_vector(&mut rom.prg, RESET_OFFSET_FROM_END, load_addr);
    info!(
        "startup routine ({} bytes) at ${:04X}, returns to ${:04X}",
        len, load_addr, original_reset
    );
    Ok(rom)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_bank(prg: PrgSize, gap_start: usize, gap_len: usize) -> Vec<u8> {
        let mut bank = vec![0xEA; prg.bank_size()];
        for byte in &mut bank[gap_start..gap_start + gap_len] {
            *byte = 0;
        }
        let len = bank.len();
        write_vector(&mut bank, RESET_OFFSET_FROM_END, 0x8000);
        bank[len - 6..len - 4].copy_from_slice(&0x8003u16.to_le_bytes());
        bank[len - 2..].copy_from_slice(&0x8003u16.to_le_bytes());
        bank
    }

    fn startup(bytes: &[u8]) -> Segment {
        Segment { origin: 0, bytes: bytes.to_vec(), relocations: Vec::new() }
    }

    #[test]
    fn test_header_bytes() {
        let header = Header::new(PrgSize::Nrom256);
        assert_eq!(
            header.to_bytes(),
            [0x4E, 0x45, 0x53, 0x1A, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_header_flags_round_trip() {
        let header = Header {
            prg_banks: 1,
            chr_banks: 1,
            mirroring: Mirroring::Vertical,
            battery: true,
            mapper: 0x21,
            pal: true,
            ..Default::default()
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[6], 0x13);
        assert_eq!(bytes[7], 0x20);
        assert_eq!(bytes[9], 0x01);
        assert_eq!(Header::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_parse_errors() {
        assert_eq!(Header::parse(&[0x4E, 0x45]).unwrap_err(), RomError::Truncated(2));
        assert_eq!(Header::parse(&[0u8; 16]).unwrap_err(), RomError::BadMagic);
    }

    #[test]
    fn test_layout_bank_vectors() {
        let main = Segment { origin: 0xC000, bytes: vec![0x78, 0x40], relocations: Vec::new() };
        let vectors = Vectors { nmi: 0xC001, reset: 0xC000, irq: 0xC001 };
        let bank = layout_bank(&main, vectors, PrgSize::Nrom128).unwrap();
        assert_eq!(bank.len(), 0x4000);
        assert_eq!(&bank[..2], &[0x78, 0x40]);
        assert_eq!(&bank[0x3FFA..], &[0x01, 0xC0, 0x00, 0xC0, 0x01, 0xC0]);
    }

    #[test]
    fn test_layout_bank_too_large() {
        let main = Segment { origin: 0xC000, bytes: vec![0xEA; 0x3FFB], relocations: Vec::new() };
        assert_eq!(
            layout_bank(&main, Vectors::default(), PrgSize::Nrom128).unwrap_err(),
            RomError::ProgramTooLarge { len: 0x3FFB, capacity: 0x3FFA }
        );
    }

    #[test]
    fn test_find_zero_window() {
        let bank = [1, 0, 0, 1, 0, 0, 0, 1];
        assert_eq!(find_zero_window(&bank, 2), Some(1));
        assert_eq!(find_zero_window(&bank, 3), Some(4));
        assert_eq!(find_zero_window(&bank, 4), None);
        assert_eq!(find_zero_window(&bank, 0), None);
    }

    #[test]
    fn test_startup_placed_in_first_gap() {
        let bank = data_bank(PrgSize::Nrom256, 0x1234, 0x40);
        let rom = assemble(Header::new(PrgSize::Nrom256), bank.clone(), &startup(&[0xA9, 0x01])).unwrap();
        assert_eq!(&rom.prg[0x1234..0x1239], &[0xA9, 0x01, 0x4C, 0x00, 0x80]);
        assert_eq!(rom.vectors().reset, 0x8000 + 0x1234);
        assert_eq!(rom.vectors().nmi, 0x8003);
        // Everything outside the window is untouched
        assert_eq!(&rom.prg[..0x1234], &bank[..0x1234]);
        assert_eq!(&rom.prg[0x1239..bank.len() - 6], &bank[0x1239..bank.len() - 6]);
    }

    #[test]
    fn test_startup_relocated() {
        let bank = data_bank(PrgSize::Nrom128, 0x100, 0x10);
        // loop: NOP; JMP loop
        let routine = Segment { origin: 0, bytes: vec![0xEA, 0x4C, 0x00, 0x00], relocations: vec![2] };
        let mut header = Header::new(PrgSize::Nrom128);
        header.mirroring = Mirroring::Vertical;
        let rom = assemble(header, bank, &routine).unwrap();
        assert_eq!(&rom.prg[0x100..0x107], &[0xEA, 0x4C, 0x00, 0xC1, 0x4C, 0x00, 0x80]);
        assert_eq!(rom.vectors().reset, 0xC100);
    }

    #[test]
    fn test_no_space_for_startup() {
        let bank = data_bank(PrgSize::Nrom128, 0x10, 4);
        let err = assemble(Header::new(PrgSize::Nrom128), bank, &startup(&[1, 2])).unwrap_err();
        assert_eq!(err, RomError::NoSpaceForStartup(5));
    }

    #[test]
    fn test_empty_startup_leaves_bank_alone() {
        let bank = data_bank(PrgSize::Nrom128, 0x10, 4);
        let rom = assemble(Header::new(PrgSize::Nrom128), bank.clone(), &Segment::default()).unwrap();
        assert_eq!(rom.prg, bank);
    }

    #[test]
    fn test_bank_size_must_match_header() {
        let err = Rom::new(Header::new(PrgSize::Nrom256), vec![0; 0x4000]).unwrap_err();
        assert_eq!(err, RomError::SizeMismatch { expected: 0x8000, actual: 0x4000 });
    }

    #[test]
    fn test_serialize_and_read_back() {
        let mut header = Header::new(PrgSize::Nrom128);
        header.chr_banks = 1;
        let rom = Rom::new(header, data_bank(PrgSize::Nrom128, 0, 1)).unwrap();
        let mut out = Vec::new();
        rom.write_to(&mut out).unwrap();
        assert_eq!(out.len(), 16 + 0x4000 + 0x2000);
        assert_eq!(out, rom.to_bytes());
        assert_eq!(&out[..4], b"NES\x1A");
        assert_eq!(Rom::from_bytes(&out).unwrap(), rom);
        assert!(matches!(Rom::from_bytes(&out[..100]), Err(RomError::SizeMismatch { .. })));
    }
}
