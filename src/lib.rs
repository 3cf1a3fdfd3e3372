//! Package implement cursor-oriented access to xBase-family database
//! files, the binary on-disk format pioneered by dBASE III and extended
//! by FoxPro / Visual FoxPro.
//!
//! A database is up to three sibling files sharing a stem:
//!
//! * The data file, `.dbf`, a fixed-layout header followed by an array
//!   of fixed-width records. Refer to [dbf] module for details.
//! * The memo file, `.fpt`, holding variable-length text blocks that
//!   memo cells in the data file point into.
//! * The compound index, `.cdx`, a single file containing several
//!   tagged B+ trees, each built from a key expression evaluated per
//!   record. Refer to [cdx] module for details.
//!
//! The user-facing entry point is [Cursor]. It owns the data file,
//! resolves memo references when the memo sibling is present, and can
//! attach one or more compound indexes. While a tag is selected,
//! navigation and seek operate in key order instead of physical order.
//!
//! ```ignore
//! let mut config = xbase::Config::default();
//! config.set_safety(false);
//!
//! let mut cursor = xbase::Cursor::open(config, "accounts")?;
//! let name = cursor.field("NAME").unwrap();
//! cursor.first()?;
//! while !cursor.eof() {
//!     println!("{}", cursor.as_string(name)?);
//!     cursor.next()?;
//! }
//! ```
//!
//! Mutations flow through an in-memory transaction journal when a
//! transaction is active, refer to [txn] module. All concurrent access
//! is mediated by a process-wide lock registry, refer to [lock] module.

#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        let msg = format!($($arg),+);
        Err(Error::$v(prefix, msg))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!("{}", err);
                Err(Error::$v(prefix, msg))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!("{} {}", format!($($arg),+), err);
                Err(Error::$v(prefix, msg))
            }
        }
    }};
}

pub mod cdx;
pub mod dbf;
pub mod fio;
pub mod lock;
pub mod txn;
pub mod util;

pub use crate::cdx::{CdxFile, SeekResult, TagSpec};
pub use crate::dbf::{Config, Cursor, Field, FieldInfo, FieldType, Value};

/// Type alias for Result return type, used by this package.
pub type Result<T> = std::result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// `file:line-no` where the error originated, and a message.
#[derive(Clone, Debug)]
pub enum Error {
    Fatal(String, String),
    FailConvert(String, String),
    IoOpen(String, String),
    IoRead(String, String),
    IoWrite(String, String),
    IoSeek(String, String),
    IoClose(String, String),
    CreateExists(String, String),
    BadFormat(String, String),
    BadRecord(String, String),
    LockBusy(String, String),
    IndexError(String, String),
}

impl Error {
    /// Numeric code for cross-process use. Zero means no error, every
    /// error maps to a negative value.
    pub fn to_code(&self) -> i32 {
        match self {
            Error::Fatal(_, _) => -910,
            Error::FailConvert(_, _) => -910,
            Error::IoOpen(_, _) => -920,
            Error::IoRead(_, _) => -930,
            Error::IoWrite(_, _) => -940,
            Error::IoSeek(_, _) => -950,
            Error::IoClose(_, _) => -960,
            Error::CreateExists(_, _) => -970,
            Error::BadFormat(_, _) => -980,
            Error::BadRecord(_, _) => -980,
            Error::LockBusy(_, _) => -920,
            Error::IndexError(_, _) => -990,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use Error::{BadFormat, BadRecord, CreateExists, FailConvert, Fatal};
        use Error::{IndexError, IoClose, IoOpen, IoRead, IoSeek, IoWrite, LockBusy};

        match self {
            Fatal(p, m) => write!(f, "Fatal:{} {}", p, m),
            FailConvert(p, m) => write!(f, "FailConvert:{} {}", p, m),
            IoOpen(p, m) => write!(f, "IoOpen:{} {}", p, m),
            IoRead(p, m) => write!(f, "IoRead:{} {}", p, m),
            IoWrite(p, m) => write!(f, "IoWrite:{} {}", p, m),
            IoSeek(p, m) => write!(f, "IoSeek:{} {}", p, m),
            IoClose(p, m) => write!(f, "IoClose:{} {}", p, m),
            CreateExists(p, m) => write!(f, "CreateExists:{} {}", p, m),
            BadFormat(p, m) => write!(f, "BadFormat:{} {}", p, m),
            BadRecord(p, m) => write!(f, "BadRecord:{} {}", p, m),
            LockBusy(p, m) => write!(f, "LockBusy:{} {}", p, m),
            IndexError(p, m) => write!(f, "IndexError:{} {}", p, m),
        }
    }
}

impl std::error::Error for Error {}
