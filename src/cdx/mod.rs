//! Module implement the compound index, a single file containing a
//! sibling set of tagged B+ trees.
//!
//! Every block in the file is 512 bytes. Block zero is the tag
//! directory; each directory entry names a tag and points at its
//! header block, which carries the root pointer, the key length, the
//! flag byte and the key-expression source. A tree block is either a
//! leaf, holding keys and record numbers, or a branch, holding
//! separator keys and child pointers; the leaves of one tag are
//! linearly linked in key order, which is what ordered traversal
//! walks.
//!
//! Keys are derived by evaluating the tag's expression against the
//! current record, refer to [expr], and rendered to the tag's fixed
//! key length, refer to [Tag]. Lookups answer with a three-way
//! [SeekResult]. Trees are built bottom-up from sorted key pairs by
//! [crate::Cursor::reindex]; record mutations mark the affected tags
//! stale instead of editing blocks in place.

pub mod block;
pub mod expr;
mod index;
mod tag;

pub use index::{CdxFile, SeekResult};
pub use tag::{KeyType, Tag, TagSpec};
