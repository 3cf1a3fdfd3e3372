use log::debug;

use std::convert::TryFrom;

use crate::{dbf::field::FieldType, fio::FileHandle, util, Error, Result};

pub const HEADER_SIZE: usize = 32;
pub const DESCRIPTOR_SIZE: usize = 32;
pub const TERMINATOR: u8 = 0x0D;
pub const TOMBSTONE_LIVE: u8 = b' ';
pub const TOMBSTONE_DELETED: u8 = b'*';

pub const MAX_FIELD_NAME: usize = 10;

/// Format-variant byte at offset zero of the data-file header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Version {
    /// dBASE III, 0x03.
    DBase3,
    /// Visual FoxPro, 0x30.
    VisualFoxPro,
    /// dBASE IV with memo, 0x43.
    DBase4Memo,
    /// FoxPro 2 with memo, 0xF5.
    FoxPro2Memo,
}

impl TryFrom<u8> for Version {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Version> {
        match byte {
            0x03 => Ok(Version::DBase3),
            0x30 => Ok(Version::VisualFoxPro),
            0x43 => Ok(Version::DBase4Memo),
            0xF5 => Ok(Version::FoxPro2Memo),
            byte => err_at!(BadFormat, msg: "format-variant {:#04x}", byte),
        }
    }
}

impl Version {
    pub fn to_byte(&self) -> u8 {
        match self {
            Version::DBase3 => 0x03,
            Version::VisualFoxPro => 0x30,
            Version::DBase4Memo => 0x43,
            Version::FoxPro2Memo => 0xF5,
        }
    }
}

/// Code-page byte at offset 29 of the data-file header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodePage {
    /// U.S. MS-DOS, 437.
    MsDos437,
    /// International MS-DOS, 850.
    MsDos850,
    /// Windows ANSI, 1252.
    Windows1252,
    Unknown(u8),
}

impl From<u8> for CodePage {
    fn from(byte: u8) -> CodePage {
        match byte {
            0x01 => CodePage::MsDos437,
            0x02 => CodePage::MsDos850,
            0x03 => CodePage::Windows1252,
            byte => CodePage::Unknown(byte),
        }
    }
}

impl CodePage {
    pub fn to_byte(&self) -> u8 {
        match self {
            CodePage::MsDos437 => 0x01,
            CodePage::MsDos850 => 0x02,
            CodePage::Windows1252 => 0x03,
            CodePage::Unknown(byte) => *byte,
        }
    }

    pub fn from_page_number(page: u16) -> CodePage {
        match page {
            437 => CodePage::MsDos437,
            850 => CodePage::MsDos850,
            1252 => CodePage::Windows1252,
            _ => CodePage::Unknown(0),
        }
    }
}

/// Fixed 32-byte header at the top of every data file.
#[derive(Clone, Debug)]
pub struct Header {
    pub version: Version,
    /// Last-modified date. Out-of-range bytes on disk decode to the
    /// zero date rather than an error.
    pub updated: util::Date,
    pub n_records: u32,
    pub header_len: u16,
    pub record_len: u16,
    pub code_page: CodePage,
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE {
            err_at!(BadFormat, msg: "header {}/{} bytes", buf.len(), HEADER_SIZE)?;
        }

        let version = Version::try_from(buf[0])?;
        let updated = {
            let (y, m, d) = (buf[1], buf[2], buf[3]);
            let date = util::Date {
                year: 1900_u16.saturating_add(y as u16),
                month: m,
                day: d,
            };
            if (1..=12).contains(&m) && (1..=31).contains(&d) && date.is_valid() {
                date
            } else {
                util::Date::empty()
            }
        };
        let n_records = util::u32_from_le(&buf[4..8]);
        let header_len = util::u16_from_le(&buf[8..10]);
        let record_len = util::u16_from_le(&buf[10..12]);
        let code_page = CodePage::from(buf[29]);

        if header_len < 33 {
            err_at!(BadFormat, msg: "header-len {}", header_len)?;
        }
        if record_len < 1 {
            err_at!(BadFormat, msg: "record-len {}", record_len)?;
        }

        Ok(Header { version, updated, n_records, header_len, record_len, code_page })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0_u8; HEADER_SIZE];

        buf[0] = self.version.to_byte();
        if !self.updated.is_empty() {
            buf[1] = (self.updated.year.saturating_sub(1900) & 0xff) as u8;
            buf[2] = self.updated.month;
            buf[3] = self.updated.day;
        }
        buf[4..8].copy_from_slice(&self.n_records.to_le_bytes());
        buf[8..10].copy_from_slice(&self.header_len.to_le_bytes());
        buf[10..12].copy_from_slice(&self.record_len.to_le_bytes());
        buf[29] = self.code_page.to_byte();

        buf
    }

    /// Byte position of record `recno`, 1-based. Record zero is never
    /// a valid destination.
    pub fn record_pos(&self, recno: u32) -> u64 {
        (self.header_len as u64) + ((recno as u64) - 1) * (self.record_len as u64)
    }

    pub fn file_len(&self) -> u64 {
        (self.header_len as u64) + (self.n_records as u64) * (self.record_len as u64)
    }
}

/// One field of the record layout.
///
/// Offsets are derived sequentially starting at one, right after the
/// tombstone byte, and are not read back from disk.
#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub name: String,
    pub typ: FieldType,
    pub length: u8,
    pub decimals: u8,
    pub nullable: bool,
    pub binary: bool,
    pub(crate) offset: usize,
}

impl FieldInfo {
    /// Describe a field for [crate::Cursor::create]. Names are at most
    /// ten bytes and stored upper-cased.
    pub fn new(name: &str, typ: FieldType, length: u8, decimals: u8) -> Result<FieldInfo> {
        if name.is_empty() || name.len() > MAX_FIELD_NAME {
            err_at!(BadFormat, msg: "field name {:?}", name)?;
        }
        if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            err_at!(BadFormat, msg: "field name {:?}", name)?;
        }
        if length == 0 {
            err_at!(BadFormat, msg: "field {:?} length 0", name)?;
        }

        let length = match typ {
            FieldType::Date => 8,
            FieldType::Logical => 1,
            _ => length,
        };

        Ok(FieldInfo {
            name: name.to_uppercase(),
            typ,
            length,
            decimals,
            nullable: false,
            binary: false,
            offset: 0,
        })
    }

    pub fn set_nullable(&mut self, nullable: bool) -> &mut Self {
        self.nullable = nullable;
        self
    }

    pub fn set_binary(&mut self, binary: bool) -> &mut Self {
        self.binary = binary;
        self
    }

    fn decode(buf: &[u8]) -> Result<FieldInfo> {
        let name = {
            let name = util::nul_terminated(&buf[0..11]);
            let name = std::str::from_utf8(name);
            err_at!(BadFormat, name, "field name")?.trim().to_uppercase()
        };
        if name.is_empty() {
            err_at!(BadFormat, msg: "empty field name")?;
        }

        let typ = FieldType::from(buf[11]);
        let length = buf[16];
        let decimals = buf[17];
        let nullable = buf[18] != 0;
        let binary = buf[19] != 0;

        if length == 0 {
            err_at!(BadFormat, msg: "field {:?} length 0", name)?;
        }

        Ok(FieldInfo { name, typ, length, decimals, nullable, binary, offset: 0 })
    }

    fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0_u8; DESCRIPTOR_SIZE];

        let name = self.name.as_bytes();
        buf[..name.len().min(11)].copy_from_slice(&name[..name.len().min(11)]);
        buf[11] = self.typ.to_code();
        buf[16] = self.length;
        buf[17] = self.decimals;
        buf[18] = self.nullable as u8;
        buf[19] = self.binary as u8;

        buf
    }
}

/// Derive per-field offsets and check the layout invariants, record
/// length is one tombstone byte plus the sum of field lengths and
/// header length is `32 + 32·n + 1`.
pub fn seal_layout(header: &Header, fields: &mut [FieldInfo]) -> Result<()> {
    let mut offset = 1_usize;
    for field in fields.iter_mut() {
        field.offset = offset;
        offset += field.length as usize;
    }

    if offset != header.record_len as usize {
        err_at!(BadFormat, msg: "record-len {} != {}", header.record_len, offset)?;
    }
    let want = HEADER_SIZE + DESCRIPTOR_SIZE * fields.len() + 1;
    if header.header_len as usize != want {
        err_at!(BadFormat, msg: "header-len {} != {}", header.header_len, want)?;
    }

    for (i, field) in fields.iter().enumerate() {
        for other in fields[..i].iter() {
            if field.name.eq_ignore_ascii_case(&other.name) {
                err_at!(BadFormat, msg: "duplicate field {:?}", field.name)?;
            }
        }
    }

    Ok(())
}

/// Read the header and the descriptor table from an open data file.
pub fn load(fh: &mut FileHandle) -> Result<(Header, Vec<FieldInfo>)> {
    let header = {
        let mut buf = [0_u8; HEADER_SIZE];
        let n = fh.read_at(0, &mut buf)?;
        if n < HEADER_SIZE {
            err_at!(BadFormat, msg: "header {}/{} bytes", n, HEADER_SIZE)?;
        }
        Header::decode(&buf)?
    };

    let mut fields = vec![];
    let mut pos = HEADER_SIZE as u64;
    loop {
        let mut buf = [0_u8; DESCRIPTOR_SIZE];
        let n = fh.read_at(pos, &mut buf)?;
        if n < 1 {
            err_at!(BadFormat, msg: "missing descriptor terminator")?;
        }
        if buf[0] == TERMINATOR {
            break;
        }
        if n < DESCRIPTOR_SIZE {
            err_at!(BadFormat, msg: "descriptor {}/{} bytes", n, DESCRIPTOR_SIZE)?;
        }
        fields.push(FieldInfo::decode(&buf)?);
        pos += DESCRIPTOR_SIZE as u64;
    }

    if fields.is_empty() {
        err_at!(BadFormat, msg: "no fields")?;
    }

    seal_layout(&header, &mut fields)?;

    debug!(
        target: "dbf",
        "loaded {:?} fields:{} records:{}",
        fh.to_location(), fields.len(), header.n_records
    );

    Ok((header, fields))
}

/// Write the header, the descriptor table and the terminator.
pub fn store(fh: &mut FileHandle, header: &Header, fields: &[FieldInfo]) -> Result<()> {
    fh.write_at(0, &header.encode())?;

    let mut pos = HEADER_SIZE as u64;
    for field in fields.iter() {
        fh.write_at(pos, &field.encode())?;
        pos += DESCRIPTOR_SIZE as u64;
    }
    fh.write_at(pos, &[TERMINATOR])?;

    Ok(())
}

/// Rewrite just the 32-byte header, after record-count or date changes.
pub fn store_header(fh: &mut FileHandle, header: &Header) -> Result<()> {
    fh.write_at(0, &header.encode())
}

#[cfg(test)]
#[path = "header_test.rs"]
mod header_test;
