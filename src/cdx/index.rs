use log::debug;

use std::{convert::TryFrom, ffi};

use crate::{
    cdx::block::{self, Block, BranchBlock, LeafBlock, BLOCK_SIZE},
    cdx::tag::{KeyType, Tag, TagSpec, TagState, MAX_TAG_NAME},
    fio::FileHandle,
    util, Error, Result,
};

// Block zero is the tag directory, 16 fixed slots of 32 bytes each:
// a u32 header-block pointer, zero for an empty slot, and the tag
// name, 11 bytes NUL-padded.
const DIR_SLOTS: usize = 16;
const DIR_SLOT_SIZE: usize = 32;

/// Three-way outcome of a key lookup, refer to [crate::Cursor::seek].
///
/// The numeric code values are externally observable, `Success` = 0,
/// `Found` = 1, `After` = 2, `Eof` = 3. `Found` is the exact-match
/// alias reported when the matched key also has duplicates following
/// it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeekResult {
    Success,
    Found,
    After,
    Eof,
}

impl SeekResult {
    pub fn to_code(&self) -> i32 {
        match self {
            SeekResult::Success => 0,
            SeekResult::Found => 1,
            SeekResult::After => 2,
            SeekResult::Eof => 3,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, SeekResult::Success | SeekResult::Found)
    }
}

/// A compound index, one file holding a sibling set of tagged B+
/// trees over a shared 512-byte block space.
pub struct CdxFile {
    location: ffi::OsString,
    fh: FileHandle,
    tags: Vec<Tag>,
}

impl CdxFile {
    /// Open an existing compound index and discover its tags through
    /// the directory at block zero.
    pub fn open(file: &ffi::OsStr) -> Result<CdxFile> {
        let mut fh = match FileHandle::open(file, Default::default()) {
            Ok(fh) => fh,
            Err(Error::IoOpen(p, m)) => return Err(Error::IndexError(p, m)),
            Err(err) => return Err(err),
        };

        let mut dir = [0_u8; BLOCK_SIZE];
        if fh.read_at(0, &mut dir)? < BLOCK_SIZE {
            err_at!(IndexError, msg: "index {:?} missing directory", file)?;
        }

        let mut tags = vec![];
        for slot in 0..DIR_SLOTS {
            let off = slot * DIR_SLOT_SIZE;
            let header_block = util::u32_from_le(&dir[off..off + 4]);
            if header_block == 0 {
                continue;
            }
            let name = {
                let name = util::nul_terminated(&dir[off + 4..off + 15]);
                let name = std::str::from_utf8(name);
                err_at!(IndexError, name, "tag name")?.trim().to_uppercase()
            };

            let mut buf = vec![0_u8; BLOCK_SIZE];
            let pos = (header_block as u64) * (BLOCK_SIZE as u64);
            if fh.read_at(pos, &mut buf)? < BLOCK_SIZE {
                err_at!(IndexError, msg: "tag {:?} header short", name)?;
            }
            let mut tag = Tag::decode(header_block, &buf)?;
            tag.name = name;
            tags.push(tag);
        }

        if tags.is_empty() {
            err_at!(IndexError, msg: "index {:?} has no tags", file)?;
        }

        debug!(target: "cdx", "opened {:?} tags:{}", file, tags.len());

        Ok(CdxFile { location: file.to_os_string(), fh, tags })
    }

    /// Lay out a new compound index, a directory and one empty tag per
    /// spec. Trees are built by the first [crate::Cursor::reindex].
    pub(crate) fn create(
        file: &ffi::OsStr,
        specs: &[(TagSpec, KeyType, usize)],
        collation: u64,
        safety: bool,
        temp: bool,
    ) -> Result<CdxFile> {
        if specs.is_empty() || specs.len() > DIR_SLOTS {
            err_at!(IndexError, msg: "{} tags for index {:?}", specs.len(), file)?;
        }

        let mut fh = FileHandle::create(file, safety, temp)?;

        let mut dir = vec![0_u8; BLOCK_SIZE];
        let mut tags = vec![];
        for (slot, (spec, key_type, key_len)) in specs.iter().enumerate() {
            let name = spec.name.trim().to_uppercase();
            if name.is_empty() || name.len() > MAX_TAG_NAME {
                err_at!(IndexError, msg: "tag name {:?}", spec.name)?;
            }
            if tags.iter().any(|t: &Tag| t.name == name) {
                err_at!(IndexError, msg: "duplicate tag {:?}", name)?;
            }

            let header_block = (slot + 1) as u32;
            let off = slot * DIR_SLOT_SIZE;
            dir[off..off + 4].copy_from_slice(&header_block.to_le_bytes());
            dir[off + 4..off + 4 + name.len()].copy_from_slice(name.as_bytes());

            let tag = Tag {
                name,
                expression: spec.expression.clone(),
                filter: spec.filter.clone(),
                key_len: *key_len,
                key_type: *key_type,
                unique: spec.unique,
                descending: spec.descending,
                compact: true,
                compound: true,
                collation,
                root: 0,
                n_keys: 0,
                header_block,
                stale: true, // nothing built yet
                state: TagState::unpositioned(),
            };
            tags.push(tag);
        }

        fh.write_at(0, &dir)?;
        for tag in tags.iter() {
            let pos = (tag.header_block as u64) * (BLOCK_SIZE as u64);
            fh.write_at(pos, &tag.encode()?)?;
        }
        fh.flush()?;

        debug!(target: "cdx", "created {:?} tags:{}", file, tags.len());

        Ok(CdxFile { location: file.to_os_string(), fh, tags })
    }

    pub fn to_location(&self) -> ffi::OsString {
        self.location.clone()
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn n_tags(&self) -> usize {
        self.tags.len()
    }

    pub fn tag(&self, slot: usize) -> Option<&Tag> {
        self.tags.get(slot)
    }

    /// Tag lookup by name, case-insensitive.
    pub fn tag_by_name(&self, name: &str) -> Option<usize> {
        self.tags.iter().position(|tag| tag.name.eq_ignore_ascii_case(name.trim()))
    }

    pub(crate) fn mark_stale(&mut self) {
        for tag in self.tags.iter_mut() {
            tag.stale = true;
        }
    }

    pub(crate) fn as_fh(&self) -> &FileHandle {
        &self.fh
    }

    pub fn flush(&mut self) -> Result<()> {
        self.fh.flush()
    }
}

impl CdxFile {
    /// Position on the leftmost key, None when the tag is empty.
    pub(crate) fn tag_first(&mut self, slot: usize) -> Result<Option<u32>> {
        let (root, key_len) = (self.tags[slot].root, self.tags[slot].key_len);
        let leaf = match self.leftmost(root, key_len)? {
            Some(leaf) => leaf,
            None => {
                self.tags[slot].state = TagState::unpositioned();
                return Ok(None);
            }
        };
        self.land(slot, leaf.0, &leaf.1, 0)
    }

    /// Position on the rightmost key, None when the tag is empty.
    pub(crate) fn tag_last(&mut self, slot: usize) -> Result<Option<u32>> {
        let (root, key_len) = (self.tags[slot].root, self.tags[slot].key_len);
        if root == 0 {
            self.tags[slot].state = TagState::unpositioned();
            return Ok(None);
        }

        let mut block_no = root;
        loop {
            match read_block(&mut self.fh, block_no, key_len)? {
                Block::Branch(branch) => match branch.entries.last() {
                    Some((_, child)) => block_no = *child,
                    None => err_at!(IndexError, msg: "empty branch {}", block_no)?,
                },
                Block::Leaf(leaf) if leaf.entries.is_empty() => {
                    self.tags[slot].state = TagState::unpositioned();
                    return Ok(None);
                }
                Block::Leaf(leaf) => {
                    let last = leaf.entries.len() - 1;
                    return self.land(slot, block_no, &leaf, last);
                }
            }
        }
    }

    /// Next key in the chain. From before-first this is the first
    /// key, at end it transitions to EOF and yields None.
    pub(crate) fn tag_next(&mut self, slot: usize) -> Result<Option<u32>> {
        let state = self.tags[slot].state.clone();
        if state.eof {
            return Ok(None);
        }
        if state.bof || state.leaf == 0 {
            return self.tag_first(slot);
        }

        let key_len = self.tags[slot].key_len;
        let leaf = read_block(&mut self.fh, state.leaf, key_len)?.into_leaf()?;
        if state.slot + 1 < leaf.entries.len() {
            return self.land(slot, state.leaf, &leaf, state.slot + 1);
        }
        if leaf.next == 0 {
            self.tags[slot].state = TagState::at_eof();
            return Ok(None);
        }
        let next = read_block(&mut self.fh, leaf.next, key_len)?.into_leaf()?;
        if next.entries.is_empty() {
            err_at!(IndexError, msg: "empty chained leaf {}", leaf.next)?;
        }
        self.land(slot, leaf.next, &next, 0)
    }

    /// Previous key in the chain, None once before-first.
    pub(crate) fn tag_previous(&mut self, slot: usize) -> Result<Option<u32>> {
        let state = self.tags[slot].state.clone();
        if state.bof {
            return Ok(None);
        }
        if state.eof {
            return self.tag_last(slot);
        }

        let key_len = self.tags[slot].key_len;
        if state.slot > 0 {
            let leaf = read_block(&mut self.fh, state.leaf, key_len)?.into_leaf()?;
            return self.land(slot, state.leaf, &leaf, state.slot - 1);
        }
        let leaf = read_block(&mut self.fh, state.leaf, key_len)?.into_leaf()?;
        if leaf.prev == 0 {
            self.tags[slot].state = TagState::unpositioned();
            return Ok(None);
        }
        let prev = read_block(&mut self.fh, leaf.prev, key_len)?.into_leaf()?;
        if prev.entries.is_empty() {
            err_at!(IndexError, msg: "empty chained leaf {}", leaf.prev)?;
        }
        let last = prev.entries.len() - 1;
        self.land(slot, leaf.prev, &prev, last)
    }

    /// Rank of the current key as a fraction in `[0, 1]`.
    pub(crate) fn tag_position(&mut self, slot: usize) -> Result<f64> {
        let state = self.tags[slot].state.clone();
        let n_keys = self.tags[slot].n_keys;
        if n_keys == 0 || state.bof {
            return Ok(0.0);
        }
        if state.eof {
            return Ok(1.0);
        }

        let rank = self.rank_of(slot, state.leaf, state.slot)?;
        Ok((rank + 1) as f64 / n_keys as f64)
    }

    /// Position at the key whose rank best matches the fraction.
    pub(crate) fn tag_set_position(&mut self, slot: usize, fraction: f64) -> Result<Option<u32>> {
        let n_keys = self.tags[slot].n_keys as f64;
        if n_keys == 0.0 {
            self.tags[slot].state = TagState::unpositioned();
            return Ok(None);
        }

        let fraction = fraction.max(0.0).min(1.0);
        let target = ((fraction * n_keys).round() as u64).max(1) - 1; // 0-based rank

        let (root, key_len) = (self.tags[slot].root, self.tags[slot].key_len);
        let mut walk = match self.leftmost(root, key_len)? {
            Some(walk) => walk,
            None => {
                self.tags[slot].state = TagState::unpositioned();
                return Ok(None);
            }
        };

        let mut seen = 0_u64;
        loop {
            let (block_no, leaf) = walk;
            let n = leaf.entries.len() as u64;
            if seen + n > target {
                let slot_in_leaf = (target - seen) as usize;
                return self.land(slot, block_no, &leaf, slot_in_leaf);
            }
            seen += n;
            if leaf.next == 0 {
                let last = leaf.entries.len() - 1;
                return self.land(slot, block_no, &leaf, last);
            }
            let next = read_block(&mut self.fh, leaf.next, key_len)?.into_leaf()?;
            walk = (leaf.next, next);
        }
    }
}

impl CdxFile {
    /// Descend from the root for a key already formatted to the tag's
    /// width, comparing only the first `cmp_len` bytes.
    pub(crate) fn tag_seek(
        &mut self,
        slot: usize,
        search: &[u8],
        cmp_len: usize,
    ) -> Result<SeekResult> {
        let (root, key_len) = (self.tags[slot].root, self.tags[slot].key_len);
        let cmp_len = cmp_len.min(key_len);
        if root == 0 {
            self.tags[slot].state = TagState::at_eof();
            return Ok(SeekResult::Eof);
        }

        let mut block_no = root;
        let leaf = loop {
            match read_block(&mut self.fh, block_no, key_len)? {
                Block::Branch(branch) => {
                    if branch.entries.is_empty() {
                        err_at!(IndexError, msg: "empty branch {}", block_no)?;
                    }
                    // the child under the greatest separator not past
                    // the search key, the first child when every
                    // separator is past it.
                    let mut child = branch.entries[0].1;
                    for (sep, ptr) in branch.entries.iter() {
                        if sep[..cmp_len] <= search[..cmp_len] {
                            child = *ptr;
                        } else {
                            break;
                        }
                    }
                    block_no = child;
                }
                Block::Leaf(leaf) => break leaf,
            }
        };

        let idx = leaf
            .entries
            .partition_point(|(key, _)| key[..cmp_len] < search[..cmp_len]);

        if idx >= leaf.entries.len() {
            // all keys here are lower, the least greater key is the
            // first of the next chained leaf.
            return match leaf.next {
                0 => {
                    self.tags[slot].state = TagState::at_eof();
                    Ok(SeekResult::Eof)
                }
                next => {
                    let key_len = self.tags[slot].key_len;
                    let leaf = read_block(&mut self.fh, next, key_len)?.into_leaf()?;
                    if leaf.entries.is_empty() {
                        err_at!(IndexError, msg: "empty chained leaf {}", next)?;
                    }
                    self.land(slot, next, &leaf, 0)?;
                    Ok(SeekResult::After)
                }
            };
        }

        let exact = leaf.entries[idx].0[..cmp_len] == search[..cmp_len];
        if !exact {
            self.land(slot, block_no, &leaf, idx)?;
            return Ok(SeekResult::After);
        }

        // walk back through the chain to the first duplicate.
        let (mut block_no, mut leaf, mut idx) = (block_no, leaf, idx);
        while idx == 0 && leaf.prev != 0 {
            let prev = read_block(&mut self.fh, leaf.prev, key_len)?.into_leaf()?;
            let continues = match prev.entries.last() {
                Some((key, _)) => key[..cmp_len] == search[..cmp_len],
                None => false,
            };
            if !continues {
                break;
            }
            block_no = leaf.prev;
            idx = prev.entries.len() - 1;
            leaf = prev;
        }
        while idx > 0 && leaf.entries[idx - 1].0[..cmp_len] == search[..cmp_len] {
            idx -= 1;
        }

        let duplicated = match leaf.entries.get(idx + 1) {
            Some((key, _)) => key[..cmp_len] == search[..cmp_len],
            None if leaf.next != 0 => {
                let next = read_block(&mut self.fh, leaf.next, key_len)?.into_leaf()?;
                match next.entries.first() {
                    Some((key, _)) => key[..cmp_len] == search[..cmp_len],
                    None => false,
                }
            }
            None => false,
        };

        self.land(slot, block_no, &leaf, idx)?;
        Ok(if duplicated { SeekResult::Found } else { SeekResult::Success })
    }
}

impl CdxFile {
    /// Rebuild this tag's tree from `(formatted key, record number)`
    /// pairs. Leaves are chained in key order and branch levels built
    /// bottom-up; blocks are allocated sequentially from the current
    /// end of the file, the free list is not reused.
    pub(crate) fn rebuild(&mut self, slot: usize, mut pairs: Vec<(Vec<u8>, u32)>) -> Result<()> {
        let (key_len, unique) = (self.tags[slot].key_len, self.tags[slot].unique);

        // stable over record order so that a unique tag keeps the
        // first record of every duplicate run.
        pairs.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        if unique {
            pairs.dedup_by(|a, b| a.0 == b.0);
        }
        let n_keys = u32::try_from(pairs.len()).ok().unwrap_or(u32::MAX);

        let cap = block::max_entries(key_len);
        let mut next_block = {
            let len = self.fh.len()?;
            let blocks = (len + (BLOCK_SIZE as u64) - 1) / (BLOCK_SIZE as u64);
            u32::try_from(blocks.max(1)).ok().unwrap_or(u32::MAX)
        };

        let root = if pairs.is_empty() {
            0
        } else {
            // write the chained leaves.
            let n_leaves = (pairs.len() + cap - 1) / cap;
            let first_leaf = next_block;
            let mut level: Vec<(Vec<u8>, u32)> = vec![];
            for (i, chunk) in pairs.chunks(cap).enumerate() {
                let block_no = first_leaf + i as u32;
                let leaf = LeafBlock {
                    prev: if i == 0 { 0 } else { block_no - 1 },
                    next: if i + 1 == n_leaves { 0 } else { block_no + 1 },
                    entries: chunk.to_vec(),
                };
                self.write_block(block_no, &leaf.encode(key_len)?)?;
                level.push((chunk[0].0.clone(), block_no));
            }
            next_block = first_leaf + n_leaves as u32;

            // build the branch levels bottom-up until one block is
            // left, that block is the root.
            while level.len() > 1 {
                let mut upper = vec![];
                for chunk in level.chunks(cap) {
                    let branch = BranchBlock { entries: chunk.to_vec() };
                    self.write_block(next_block, &branch.encode(key_len)?)?;
                    upper.push((chunk[0].0.clone(), next_block));
                    next_block += 1;
                }
                level = upper;
            }
            level[0].1
        };

        let tag = &mut self.tags[slot];
        tag.root = root;
        tag.n_keys = n_keys;
        tag.stale = false;
        tag.state = TagState::unpositioned();

        let header = self.tags[slot].encode()?;
        let pos = (self.tags[slot].header_block as u64) * (BLOCK_SIZE as u64);
        self.fh.write_at(pos, &header)?;
        self.fh.flush()?;

        debug!(
            target: "cdx",
            "rebuilt {:?}/{} keys:{} root:{}", self.location, self.tags[slot].name, n_keys, root
        );

        Ok(())
    }
}

impl CdxFile {
    // leftmost leaf under the root, None for an empty tree.
    fn leftmost(&mut self, root: u32, key_len: usize) -> Result<Option<(u32, LeafBlock)>> {
        if root == 0 {
            return Ok(None);
        }
        let mut block_no = root;
        loop {
            match read_block(&mut self.fh, block_no, key_len)? {
                Block::Branch(branch) => match branch.entries.first() {
                    Some((_, child)) => block_no = *child,
                    None => err_at!(IndexError, msg: "empty branch {}", block_no)?,
                },
                Block::Leaf(leaf) if leaf.entries.is_empty() => return Ok(None),
                Block::Leaf(leaf) => return Ok(Some((block_no, leaf))),
            }
        }
    }

    // update the tag state onto (leaf, slot) and return its recno.
    fn land(
        &mut self,
        slot: usize,
        block_no: u32,
        leaf: &LeafBlock,
        slot_in_leaf: usize,
    ) -> Result<Option<u32>> {
        let (key, recno) = &leaf.entries[slot_in_leaf];
        self.tags[slot].state = TagState {
            leaf: block_no,
            slot: slot_in_leaf,
            key: key.clone(),
            recno: *recno,
            bof: false,
            eof: false,
        };
        Ok(Some(*recno))
    }

    // exact 0-based rank of (leaf, slot) by walking the chain.
    fn rank_of(&mut self, slot: usize, leaf_no: u32, slot_in_leaf: usize) -> Result<u64> {
        let (root, key_len) = (self.tags[slot].root, self.tags[slot].key_len);
        let mut walk = match self.leftmost(root, key_len)? {
            Some(walk) => walk,
            None => return Ok(0),
        };

        let mut rank = 0_u64;
        loop {
            let (block_no, leaf) = walk;
            if block_no == leaf_no {
                return Ok(rank + slot_in_leaf as u64);
            }
            rank += leaf.entries.len() as u64;
            if leaf.next == 0 {
                return Ok(rank);
            }
            let next = read_block(&mut self.fh, leaf.next, key_len)?.into_leaf()?;
            walk = (leaf.next, next);
        }
    }

    fn write_block(&mut self, block_no: u32, buf: &[u8]) -> Result<()> {
        let pos = (block_no as u64) * (BLOCK_SIZE as u64);
        self.fh.write_at(pos, buf)
    }
}

fn read_block(fh: &mut FileHandle, block_no: u32, key_len: usize) -> Result<Block> {
    let mut buf = vec![0_u8; BLOCK_SIZE];
    let pos = (block_no as u64) * (BLOCK_SIZE as u64);
    let n = fh.read_at(pos, &mut buf)?;
    if n < BLOCK_SIZE {
        err_at!(IndexError, msg: "block {} short read {}/{}", block_no, n, BLOCK_SIZE)?;
    }
    Block::decode(&buf, key_len)
}

#[cfg(test)]
#[path = "index_test.rs"]
mod index_test;
