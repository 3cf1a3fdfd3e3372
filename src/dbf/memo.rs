use log::debug;

use std::ffi;

use crate::{
    fio::{AccessMode, FileHandle},
    util, Result,
};

/// Default block size when the header carries none.
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Block type tag for text memos.
const BLOCK_TAG_TEXT: u32 = 1;

/// Largest payload accepted on read, larger length words are treated
/// as corruption and the reference reported unresolvable.
const MAX_PAYLOAD: u32 = 65_535;

/// Codec over the `.fpt` sibling of a data file.
///
/// The file header stores the next free block as a big-endian u32 at
/// `[0..4]` and the block size as a big-endian u16 at `[6..8]`, zero
/// falling back to 512. Each stored memo occupies a contiguous run of
/// blocks starting with an 8-byte header, a type tag at `[0..4]` and
/// the big-endian payload length at `[4..8]`. Block zero is the file
/// header.
pub struct MemoFile {
    fh: FileHandle,
    block_size: u16,
    next_block: u32,
}

impl MemoFile {
    pub fn open(file: &ffi::OsStr, mode: AccessMode) -> Result<MemoFile> {
        let mut fh = FileHandle::open(file, mode)?;

        let mut buf = [0_u8; 8];
        let n = fh.read_at(0, &mut buf)?;
        let (next_block, block_size) = if n == 8 {
            let block_size = match util::u16_from_be(&buf[6..8]) {
                0 => DEFAULT_BLOCK_SIZE,
                size => size,
            };
            (util::u32_from_be(&buf[0..4]).max(1), block_size)
        } else {
            (1, DEFAULT_BLOCK_SIZE)
        };

        debug!(
            target: "memo",
            "opened {:?} block-size:{} next:{}", file, block_size, next_block
        );

        Ok(MemoFile { fh, block_size, next_block })
    }

    pub fn create(file: &ffi::OsStr, safety: bool, temp: bool) -> Result<MemoFile> {
        let mut fh = FileHandle::create(file, safety, temp)?;

        let block_size = DEFAULT_BLOCK_SIZE;
        let next_block = 1_u32;

        let mut header = vec![0_u8; block_size as usize];
        header[0..4].copy_from_slice(&next_block.to_be_bytes());
        header[6..8].copy_from_slice(&block_size.to_be_bytes());
        fh.write_at(0, &header)?;

        debug!(target: "memo", "created {:?} block-size:{}", file, block_size);

        Ok(MemoFile { fh, block_size, next_block })
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Resolve a block reference to its payload, trailing NULs
    /// trimmed. None when the reference does not resolve to a sane
    /// block, the caller falls back to the raw reference bytes.
    pub fn read(&mut self, block: u32) -> Result<Option<String>> {
        if block == 0 {
            return Ok(None);
        }

        let pos = (block as u64) * (self.block_size as u64);
        let mut head = [0_u8; 8];
        if self.fh.read_at(pos, &mut head)? < 8 {
            return Ok(None);
        }

        // zero is a legitimate payload length, only absurd values are
        // treated as corruption.
        let len = util::u32_from_be(&head[4..8]);
        if len > MAX_PAYLOAD {
            return Ok(None);
        }

        let mut payload = vec![0_u8; len as usize];
        if self.fh.read_at(pos + 8, &mut payload)? < payload.len() {
            return Ok(None);
        }

        let text = util::cell_str(util::trim_trailing_nuls(&payload));
        Ok(Some(text))
    }

    /// Store a payload in a fresh run of blocks, returning the start
    /// block number for the data-record cell. Blocks are allocated
    /// sequentially, free-list reuse is not attempted.
    pub fn write(&mut self, payload: &[u8]) -> Result<u32> {
        let block = self.next_block;
        let pos = (block as u64) * (self.block_size as u64);

        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&BLOCK_TAG_TEXT.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        self.fh.write_at(pos, &buf)?;

        let used = ((buf.len() as u64) + (self.block_size as u64) - 1)
            / (self.block_size as u64);
        self.next_block = block + used as u32;
        self.fh.write_at(0, &self.next_block.to_be_bytes())?;

        Ok(block)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.fh.flush()
    }
}

#[cfg(test)]
#[path = "memo_test.rs"]
mod memo_test;
