use crate::{util, Error, Result};

/// Every block in a compound index is this size.
pub const BLOCK_SIZE: usize = 512;

const KIND_LEAF: u8 = 0x00;
const KIND_BRANCH: u8 = 0x01;

// Entries start after the fixed block prefix, one byte kind, one
// reserved, u16 entry count, and two u32 chain links (leaf) or
// reserved words (branch).
const ENTRIES_OFF: usize = 12;

/// Entries a block can carry for a given key length. Leaf entries are
/// `key + u32 record number`, branch entries `key + u32 child block`.
pub fn max_entries(key_len: usize) -> usize {
    (BLOCK_SIZE - ENTRIES_OFF) / (key_len + 4)
}

/// A leaf holds `(key, record number)` pairs in key order. Leaves of
/// one tag are linearly linked through `prev` and `next`, zero meaning
/// none.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeafBlock {
    pub prev: u32,
    pub next: u32,
    pub entries: Vec<(Vec<u8>, u32)>,
}

/// A branch holds `(separator, child block)` pairs, the separator
/// being the first key reachable under the child.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BranchBlock {
    pub entries: Vec<(Vec<u8>, u32)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Leaf(LeafBlock),
    Branch(BranchBlock),
}

impl Block {
    pub fn decode(buf: &[u8], key_len: usize) -> Result<Block> {
        if buf.len() < BLOCK_SIZE {
            err_at!(IndexError, msg: "block {}/{} bytes", buf.len(), BLOCK_SIZE)?;
        }

        let n = util::u16_from_le(&buf[2..4]) as usize;
        if ENTRIES_OFF + n * (key_len + 4) > BLOCK_SIZE {
            err_at!(IndexError, msg: "block overflow {} entries keylen {}", n, key_len)?;
        }

        let mut entries = Vec::with_capacity(n);
        let mut off = ENTRIES_OFF;
        for _i in 0..n {
            let key = buf[off..off + key_len].to_vec();
            let num = util::u32_from_le(&buf[off + key_len..off + key_len + 4]);
            entries.push((key, num));
            off += key_len + 4;
        }

        match buf[0] {
            KIND_LEAF => {
                let prev = util::u32_from_le(&buf[4..8]);
                let next = util::u32_from_le(&buf[8..12]);
                Ok(Block::Leaf(LeafBlock { prev, next, entries }))
            }
            KIND_BRANCH => Ok(Block::Branch(BranchBlock { entries })),
            kind => err_at!(IndexError, msg: "block kind {:#04x}", kind),
        }
    }

    pub fn into_leaf(self) -> Result<LeafBlock> {
        match self {
            Block::Leaf(leaf) => Ok(leaf),
            Block::Branch(_) => err_at!(IndexError, msg: "expected leaf block"),
        }
    }
}

impl LeafBlock {
    pub fn encode(&self, key_len: usize) -> Result<Vec<u8>> {
        let mut buf = encode_prefix(KIND_LEAF, self.entries.len(), key_len)?;
        buf[4..8].copy_from_slice(&self.prev.to_le_bytes());
        buf[8..12].copy_from_slice(&self.next.to_le_bytes());
        encode_entries(&mut buf, &self.entries, key_len)?;
        Ok(buf)
    }
}

impl BranchBlock {
    pub fn encode(&self, key_len: usize) -> Result<Vec<u8>> {
        let mut buf = encode_prefix(KIND_BRANCH, self.entries.len(), key_len)?;
        encode_entries(&mut buf, &self.entries, key_len)?;
        Ok(buf)
    }
}

fn encode_prefix(kind: u8, n: usize, key_len: usize) -> Result<Vec<u8>> {
    if n > max_entries(key_len) {
        err_at!(Fatal, msg: "block overflow {} entries keylen {}", n, key_len)?;
    }
    let mut buf = vec![0_u8; BLOCK_SIZE];
    buf[0] = kind;
    buf[2..4].copy_from_slice(&(n as u16).to_le_bytes());
    Ok(buf)
}

fn encode_entries(buf: &mut [u8], entries: &[(Vec<u8>, u32)], key_len: usize) -> Result<()> {
    let mut off = ENTRIES_OFF;
    for (key, num) in entries.iter() {
        if key.len() != key_len {
            err_at!(Fatal, msg: "key {}/{} bytes", key.len(), key_len)?;
        }
        buf[off..off + key_len].copy_from_slice(key);
        buf[off + key_len..off + key_len + 4].copy_from_slice(&num.to_le_bytes());
        off += key_len + 4;
    }
    Ok(())
}

#[cfg(test)]
#[path = "block_test.rs"]
mod block_test;
