use crate::{cdx::block::BLOCK_SIZE, cdx::expr::ExprValue, util, Error, Result};

pub const TYPE_UNIQUE: u8 = 0x01;
pub const TYPE_FOR: u8 = 0x08;
pub const TYPE_COMPACT: u8 = 0x32;
pub const TYPE_COMPOUND: u8 = 0x80;

const SIGNATURE: u8 = 0x01;
const VERSION: u32 = 1;

// Expression and filter source text lives in the tail of the header
// block, starting here.
const TEXT_OFF: usize = 64;

/// Maximum tag name length, upper-cased on store.
pub const MAX_TAG_NAME: usize = 10;

/// Key type a tag formats its evaluated values to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyType {
    Char,
    Num,
    Date,
    Logical,
}

impl KeyType {
    pub fn to_code(&self) -> u8 {
        match self {
            KeyType::Char => b'C',
            KeyType::Num => b'N',
            KeyType::Date => b'D',
            KeyType::Logical => b'L',
        }
    }

    pub fn from_code(code: u8) -> KeyType {
        match code {
            b'N' => KeyType::Num,
            b'D' => KeyType::Date,
            b'L' => KeyType::Logical,
            _ => KeyType::Char,
        }
    }
}

/// Description of a tag to create, refer to
/// [crate::Cursor::create_index].
#[derive(Clone, Debug)]
pub struct TagSpec {
    pub name: String,
    pub expression: String,
    pub filter: String,
    pub unique: bool,
    pub descending: bool,
}

impl TagSpec {
    pub fn new(name: &str, expression: &str) -> TagSpec {
        TagSpec {
            name: name.to_string(),
            expression: expression.to_string(),
            filter: String::default(),
            unique: false,
            descending: false,
        }
    }

    pub fn set_filter(&mut self, filter: &str) -> &mut Self {
        self.filter = filter.to_string();
        self
    }

    pub fn set_unique(&mut self, unique: bool) -> &mut Self {
        self.unique = unique;
        self
    }

    pub fn set_descending(&mut self, descending: bool) -> &mut Self {
        self.descending = descending;
        self
    }
}

// Traversal cursor of a tag, the current leaf block and the entry
// slot within it, with the entry's key and record number cached.
#[derive(Clone, Debug, Default)]
pub(crate) struct TagState {
    pub leaf: u32,
    pub slot: usize,
    pub key: Vec<u8>,
    pub recno: u32,
    pub bof: bool,
    pub eof: bool,
}

impl TagState {
    pub fn unpositioned() -> TagState {
        TagState { leaf: 0, slot: 0, key: vec![], recno: 0, bof: true, eof: false }
    }

    pub fn at_eof() -> TagState {
        TagState { leaf: 0, slot: 0, key: vec![], recno: 0, bof: false, eof: true }
    }
}

/// One B+ tree inside a compound index.
///
/// The on-disk header block holds, in order: the root block pointer,
/// the free-list head, a version number, the key length, the
/// type-code flags byte, a signature, the collation identifier, the
/// descending flag, and the positions and lengths of the expression
/// and filter source inside the block.
#[derive(Clone, Debug)]
pub struct Tag {
    pub(crate) name: String,
    pub(crate) expression: String,
    pub(crate) filter: String,
    pub(crate) key_len: usize,
    pub(crate) key_type: KeyType,
    pub(crate) unique: bool,
    pub(crate) descending: bool,
    pub(crate) compact: bool,
    pub(crate) compound: bool,
    pub(crate) collation: u64,
    pub(crate) root: u32,
    pub(crate) n_keys: u32,
    pub(crate) header_block: u32,
    pub(crate) stale: bool,
    pub(crate) state: TagState,
}

impl Tag {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_descending(&self) -> bool {
        self.descending
    }

    /// Whether records changed since the last rebuild, refer to
    /// [crate::Cursor::reindex].
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn state(&self) -> &TagState {
        &self.state
    }

    pub(crate) fn decode(header_block: u32, buf: &[u8]) -> Result<Tag> {
        if buf.len() < BLOCK_SIZE {
            err_at!(IndexError, msg: "tag header {}/{} bytes", buf.len(), BLOCK_SIZE)?;
        }
        if buf[15] != SIGNATURE {
            err_at!(IndexError, msg: "tag signature {:#04x}", buf[15])?;
        }

        let root = util::u32_from_le(&buf[0..4]);
        let _free_list = util::u32_from_le(&buf[4..8]);
        let _version = util::u32_from_le(&buf[8..12]);
        let key_len = util::u16_from_le(&buf[12..14]) as usize;
        let type_code = buf[14];
        let collation = u64::from_le_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);
        let descending = util::u16_from_le(&buf[24..26]) != 0;
        let expr_pos = util::u16_from_le(&buf[26..28]) as usize;
        let expr_len = util::u16_from_le(&buf[28..30]) as usize;
        let filter_pos = util::u16_from_le(&buf[30..32]) as usize;
        let filter_len = util::u16_from_le(&buf[32..34]) as usize;
        let n_keys = util::u32_from_le(&buf[34..38]);
        let key_type = KeyType::from_code(buf[38]);

        if key_len == 0 || key_len > BLOCK_SIZE - 16 {
            err_at!(IndexError, msg: "tag key-len {}", key_len)?;
        }
        if expr_pos + expr_len > BLOCK_SIZE || filter_pos + filter_len > BLOCK_SIZE {
            err_at!(IndexError, msg: "tag text region out of block")?;
        }

        let expression = {
            let text = std::str::from_utf8(&buf[expr_pos..expr_pos + expr_len]);
            err_at!(IndexError, text, "tag expression")?.to_string()
        };
        if expression.is_empty() {
            err_at!(IndexError, msg: "tag without expression")?;
        }
        let filter = {
            let text = std::str::from_utf8(&buf[filter_pos..filter_pos + filter_len]);
            err_at!(IndexError, text, "tag filter")?.to_string()
        };

        Ok(Tag {
            name: String::default(), // the directory entry carries it
            expression,
            filter,
            key_len,
            key_type,
            unique: (type_code & TYPE_UNIQUE) != 0,
            descending,
            compact: (type_code & TYPE_COMPACT) == TYPE_COMPACT,
            compound: (type_code & TYPE_COMPOUND) != 0,
            collation,
            root,
            n_keys,
            header_block,
            stale: false,
            state: TagState::unpositioned(),
        })
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let expr = self.expression.as_bytes();
        let filter = self.filter.as_bytes();
        if TEXT_OFF + expr.len() + filter.len() > BLOCK_SIZE {
            err_at!(IndexError, msg: "tag text {} bytes", expr.len() + filter.len())?;
        }

        let mut type_code = TYPE_COMPACT | TYPE_COMPOUND;
        if self.unique {
            type_code |= TYPE_UNIQUE;
        }
        if !self.filter.is_empty() {
            type_code |= TYPE_FOR;
        }

        let expr_pos = TEXT_OFF;
        let filter_pos = TEXT_OFF + expr.len();

        let mut buf = vec![0_u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&self.root.to_le_bytes());
        buf[4..8].copy_from_slice(&0_u32.to_le_bytes()); // free list
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[12..14].copy_from_slice(&(self.key_len as u16).to_le_bytes());
        buf[14] = type_code;
        buf[15] = SIGNATURE;
        buf[16..24].copy_from_slice(&self.collation.to_le_bytes());
        buf[24..26].copy_from_slice(&(self.descending as u16).to_le_bytes());
        buf[26..28].copy_from_slice(&(expr_pos as u16).to_le_bytes());
        buf[28..30].copy_from_slice(&(expr.len() as u16).to_le_bytes());
        buf[30..32].copy_from_slice(&(filter_pos as u16).to_le_bytes());
        buf[32..34].copy_from_slice(&(filter.len() as u16).to_le_bytes());
        buf[34..38].copy_from_slice(&self.n_keys.to_le_bytes());
        buf[38] = self.key_type.to_code();
        buf[expr_pos..expr_pos + expr.len()].copy_from_slice(expr);
        buf[filter_pos..filter_pos + filter.len()].copy_from_slice(filter);

        Ok(buf)
    }

    /// Render an evaluated value to this tag's fixed key width. None
    /// when the value cannot be coerced to the key type or does not
    /// fit, such keys are treated as empty.
    pub(crate) fn format_key(&self, value: &ExprValue) -> Option<Vec<u8>> {
        let mut key = format_value(value, self.key_type, self.key_len)?;
        if self.descending {
            complement(&mut key);
        }
        Some(key)
    }

    /// Logical text of a formatted key, for [crate::Cursor::current_key].
    pub(crate) fn unformat_key(&self, key: &[u8]) -> String {
        let mut key = key.to_vec();
        if self.descending {
            complement(&mut key);
        }
        match self.key_type {
            KeyType::Char | KeyType::Date => {
                util::cell_str(&key).trim_end().to_string()
            }
            KeyType::Logical => util::cell_str(&key[..1.min(key.len())]),
            KeyType::Num => decode_numeric_key(&key),
        }
    }
}

// For a descending tag every key byte is stored bit-complemented, so
// plain ascending byte order in the tree walks keys descending.
fn complement(key: &mut [u8]) {
    for b in key.iter_mut() {
        *b = 255 - *b;
    }
}

fn format_value(value: &ExprValue, key_type: KeyType, key_len: usize) -> Option<Vec<u8>> {
    match (key_type, value) {
        (KeyType::Char, ExprValue::Str(s)) => Some(pad_left_justified(s.as_bytes(), key_len)),
        (KeyType::Date, ExprValue::Date(d)) if d.is_empty() => None,
        (KeyType::Date, ExprValue::Date(d)) => {
            Some(pad_left_justified(d.to_yyyymmdd().as_bytes(), key_len))
        }
        (KeyType::Date, ExprValue::Str(s)) => {
            let d = util::Date::parse(s)?;
            format_value(&ExprValue::Date(d), key_type, key_len)
        }
        (KeyType::Logical, ExprValue::Bool(b)) => {
            let s = if *b { "T" } else { "F" };
            Some(pad_left_justified(s.as_bytes(), key_len))
        }
        (KeyType::Logical, ExprValue::Str(s)) => {
            let b = matches!(s.trim(), "T" | "t" | "Y" | "y" | "1");
            format_value(&ExprValue::Bool(b), key_type, key_len)
        }
        (KeyType::Num, ExprValue::Num(n)) => encode_numeric_key(*n, key_len),
        (KeyType::Num, ExprValue::Str(s)) => {
            let n: f64 = s.trim().parse().ok()?;
            encode_numeric_key(n, key_len)
        }
        (_, _) => None,
    }
}

fn pad_left_justified(bytes: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = vec![b' '; key_len];
    let n = bytes.len().min(key_len);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

// Numeric keys must order bytewise the way they order numerically.
// Byte zero is the sign flag, `-` for negatives sorting before `0`
// for everything else. The remaining width holds the absolute value,
// right-aligned with two decimals; for negatives every digit is
// nine-complemented and the padding complements to `:` so that larger
// magnitudes sort first.
fn encode_numeric_key(value: f64, key_len: usize) -> Option<Vec<u8>> {
    if key_len < 5 {
        return None;
    }

    let body = format!("{:>width$.2}", value.abs(), width = key_len - 1);
    if body.len() > key_len - 1 {
        return None; // magnitude does not fit the key width
    }

    let mut key = Vec::with_capacity(key_len);
    if value < 0.0 {
        key.push(b'-');
        for b in body.bytes() {
            match b {
                b' ' => key.push(b':'),
                b'0'..=b'9' => key.push(b'9' - (b - b'0')),
                _ => key.push(b),
            }
        }
    } else {
        key.push(b'0');
        key.extend_from_slice(body.as_bytes());
    }
    Some(key)
}

fn decode_numeric_key(key: &[u8]) -> String {
    if key.len() < 2 {
        return String::default();
    }
    match key[0] {
        b'-' => {
            let body: String = key[1..]
                .iter()
                .map(|b| match b {
                    b':' => ' ',
                    b'0'..=b'9' => (b'9' - (b - b'0')) as char,
                    b => *b as char,
                })
                .collect();
            format!("-{}", body.trim())
        }
        _ => util::cell_str(&key[1..]).trim().to_string(),
    }
}

#[cfg(test)]
#[path = "tag_test.rs"]
mod tag_test;
