use crate::util::{self, Date};

/// One-byte type code of a field descriptor.
///
/// The `B,G,P,Q,V,W,X` family and any unrecognized code decode as
/// [FieldType::Other]: raw bytes on read, character-like on assign.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldType {
    /// `C`, fixed-width text, space-padded right.
    Character,
    /// `N`, fixed-width ASCII decimal, right-aligned.
    Numeric,
    /// `F`, same storage as numeric.
    Float,
    /// `I`, fixed-width ASCII decimal.
    Integer,
    /// `Y`, fixed-width ASCII decimal with four decimal places.
    Currency,
    /// `L`, one byte, canonical `T`/`F`.
    Logical,
    /// `D`, eight bytes `YYYYMMDD`.
    Date,
    /// `T`, textual datetime.
    DateTime,
    /// `M`, block-number reference into the memo file.
    Memo,
    Other(u8),
}

impl From<u8> for FieldType {
    fn from(code: u8) -> FieldType {
        match code {
            b'C' => FieldType::Character,
            b'N' => FieldType::Numeric,
            b'F' => FieldType::Float,
            b'I' => FieldType::Integer,
            b'Y' => FieldType::Currency,
            b'L' => FieldType::Logical,
            b'D' => FieldType::Date,
            b'T' => FieldType::DateTime,
            b'M' => FieldType::Memo,
            code => FieldType::Other(code),
        }
    }
}

impl FieldType {
    pub fn to_code(&self) -> u8 {
        match self {
            FieldType::Character => b'C',
            FieldType::Numeric => b'N',
            FieldType::Float => b'F',
            FieldType::Integer => b'I',
            FieldType::Currency => b'Y',
            FieldType::Logical => b'L',
            FieldType::Date => b'D',
            FieldType::DateTime => b'T',
            FieldType::Memo => b'M',
            FieldType::Other(code) => *code,
        }
    }
}

/// Natural variant of a field value, as returned by
/// [crate::Cursor::value].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Char(String),
    Num(f64),
    Int(i64),
    Bool(bool),
    Date(Date),
    DateTime(String),
    Memo(String),
    Bytes(Vec<u8>),
}

// Decoders take the raw cell slice, the caller converts.

pub fn decode_str(cell: &[u8]) -> String {
    util::cell_str(cell)
}

pub fn decode_int(cell: &[u8]) -> i64 {
    decode_float(cell) as i64
}

pub fn decode_float(cell: &[u8]) -> f64 {
    util::cell_str(cell).trim().parse::<f64>().unwrap_or(0.0)
}

pub fn decode_bool(cell: &[u8]) -> bool {
    matches!(cell.first(), Some(b'T') | Some(b't') | Some(b'Y') | Some(b'y') | Some(b'1'))
}

pub fn decode_date(cell: &[u8]) -> Date {
    Date::from_yyyymmdd(util::cell_str(cell).trim()).unwrap_or_else(Date::empty)
}

/// Block number stored in a memo cell, zero or blank means no memo.
pub fn decode_memo_ref(cell: &[u8]) -> Option<u32> {
    match util::cell_str(cell).trim().parse::<u32>() {
        Ok(0) | Err(_) => None,
        Ok(block) => Some(block),
    }
}

/// A blank cell reads as null when the field is declared nullable.
pub fn is_blank(cell: &[u8]) -> bool {
    cell.iter().all(|b| *b == b' ')
}

// Encoders space-fill the cell first, then lay the canonical form in.

pub fn encode(cell: &mut [u8], typ: FieldType, decimals: u8, text: &str) {
    for b in cell.iter_mut() {
        *b = b' ';
    }

    match typ {
        FieldType::Character | FieldType::DateTime | FieldType::Other(_) => {
            encode_left(cell, text)
        }
        FieldType::Numeric | FieldType::Float => encode_numeric(cell, decimals, text),
        FieldType::Currency => encode_numeric(cell, 4, text),
        FieldType::Integer => encode_integer(cell, text),
        FieldType::Date => encode_date(cell, text),
        FieldType::Logical => encode_logical(cell, text),
        // memo payloads travel through the memo codec, the cell gets
        // only the block reference, refer to encode_memo_ref().
        FieldType::Memo => (),
    }
}

fn encode_left(cell: &mut [u8], text: &str) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(cell.len());
    cell[..n].copy_from_slice(&bytes[..n]);
}

fn encode_right(cell: &mut [u8], text: &str) {
    let bytes = text.as_bytes();
    if bytes.len() <= cell.len() {
        let start = cell.len() - bytes.len();
        cell[start..].copy_from_slice(bytes);
    } else {
        // overflow indicator.
        for b in cell.iter_mut() {
            *b = b'*';
        }
    }
}

fn encode_numeric(cell: &mut [u8], decimals: u8, text: &str) {
    let value: f64 = match text.trim().parse() {
        Ok(value) => value,
        Err(_) => return, // unparseable input leaves the cell blank
    };
    let formatted = format!("{:.*}", decimals as usize, value);
    encode_right(cell, &formatted);
}

fn encode_integer(cell: &mut [u8], text: &str) {
    let value: i64 = match text.trim().parse() {
        Ok(value) => value,
        Err(_) => return,
    };
    encode_right(cell, &value.to_string());
}

fn encode_date(cell: &mut [u8], text: &str) {
    match Date::parse(text) {
        Some(date) if !date.is_empty() => encode_left(cell, &date.to_yyyymmdd()),
        _ => (), // unparseable input leaves the cell blank
    }
}

fn encode_logical(cell: &mut [u8], text: &str) {
    let value = matches!(
        text.trim().to_uppercase().as_str(),
        "T" | "TRUE" | "Y" | "YES" | "1"
    );
    if let Some(b) = cell.first_mut() {
        *b = if value { b'T' } else { b'F' };
    }
}

/// Store a memo block reference as right-aligned decimal text.
pub fn encode_memo_ref(cell: &mut [u8], block: u32) {
    for b in cell.iter_mut() {
        *b = b' ';
    }
    encode_right(cell, &block.to_string());
}

#[cfg(test)]
#[path = "field_test.rs"]
mod field_test;
