//! Module implement the data file, its memo sibling and the cursor.
//!
//! A data file is a fixed 32-byte header, followed by one 32-byte
//! descriptor per field terminated by `0x0D`, followed by a contiguous
//! array of fixed-width records. The first byte of every record is the
//! tombstone, `' '` for live and `'*'` for deleted; deleted records
//! stay present and numbered until [Cursor::pack] rewrites the file.
//!
//! Use [Cursor::create] to lay out a new file from a schema and
//! [Cursor::open] to open an existing one. All record access flows
//! through the cursor, fields are addressed with cheap [Field] handles
//! resolved once via [Cursor::field] or [Cursor::field_at].

use arbitrary::Arbitrary;

mod cursor;
mod field;
mod header;
mod memo;

pub use cursor::{Cursor, Field};
pub use field::{FieldType, Value};
pub use header::{CodePage, FieldInfo, Header, Version};
pub use memo::MemoFile;

pub(crate) use header::{TOMBSTONE_DELETED, TOMBSTONE_LIVE};

/// Default extension tried when searching for the production index.
pub const INDEX_EXTENSION: &str = "cdx";

/// Context-level options recognized by cursors created from this
/// configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// On data-file open, try to open the sibling production index and
    /// select its first tag.
    pub auto_open: bool,
    /// Refuse to create a file that already exists.
    pub safety: bool,
    /// Mark newly created files for deletion on close.
    pub create_temp: bool,
    /// Format-variant selector, `30` emulates Visual FoxPro 3.0.
    pub compatibility: u16,
    /// String comparator identity recorded in created tags.
    pub collating_sequence: u64,
    /// Declared code page when creating a new file.
    pub code_page: u16,
    /// Default lock-retry budget in milliseconds, consumed only by
    /// caller-side retry loops. The lock manager itself never retries.
    pub timeout: u64,
    /// Extension used when searching for the production index.
    pub index_extension: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            auto_open: true,
            safety: true,
            create_temp: false,
            compatibility: 30,
            collating_sequence: 0,
            code_page: 1252,
            timeout: 0,
            index_extension: INDEX_EXTENSION.to_string(),
        }
    }
}

impl<'a> Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let config = Config {
            auto_open: u.arbitrary()?,
            safety: u.arbitrary()?,
            create_temp: false,
            compatibility: *u.choose(&[3, 30])?,
            collating_sequence: 0,
            code_page: *u.choose(&[437, 850, 1252])?,
            timeout: *u.choose(&[0, 10, 100])?,
            index_extension: INDEX_EXTENSION.to_string(),
        };
        Ok(config)
    }
}

impl Config {
    pub fn set_auto_open(&mut self, auto_open: bool) -> &mut Self {
        self.auto_open = auto_open;
        self
    }

    pub fn set_safety(&mut self, safety: bool) -> &mut Self {
        self.safety = safety;
        self
    }

    pub fn set_create_temp(&mut self, create_temp: bool) -> &mut Self {
        self.create_temp = create_temp;
        self
    }

    pub fn set_compatibility(&mut self, compatibility: u16) -> &mut Self {
        self.compatibility = compatibility;
        self
    }

    pub fn set_collating_sequence(&mut self, seq: u64) -> &mut Self {
        self.collating_sequence = seq;
        self
    }

    pub fn set_code_page(&mut self, code_page: u16) -> &mut Self {
        self.code_page = code_page;
        self
    }

    pub fn set_timeout(&mut self, timeout: u64) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn set_index_extension(&mut self, ext: &str) -> &mut Self {
        self.index_extension = ext.to_string();
        self
    }
}
