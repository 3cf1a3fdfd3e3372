use log::{debug, error};

use std::{convert::TryFrom, ffi, path};

use crate::{
    cdx::{
        expr::{self, EvalContext, Expr, ExprValue},
        CdxFile, KeyType, SeekResult, Tag, TagSpec,
    },
    dbf::{field, header, Config, FieldInfo, FieldType, MemoFile, Value},
    dbf::{TOMBSTONE_DELETED, TOMBSTONE_LIVE},
    fio::{AccessMode, FileHandle},
    lock,
    txn::{Entry, Journal},
    util, Error, Result,
};

/// Handle naming one field of a cursor, an index into the cursor's
/// descriptor arena. Resolve one with [Cursor::field] or
/// [Cursor::field_at] and pass it back to the typed accessors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Field(pub(crate) usize);

/// The user-facing entry point, a stateful cursor over one data file,
/// its memo sibling and any attached compound indexes.
///
/// Position is a six-state machine: unopened, empty, before-first,
/// on-record, after-last and closed. Stepping past either boundary is
/// never an error, it parks the cursor on the boundary state. While a
/// tag is selected the navigation verbs follow key order instead of
/// physical order.
pub struct Cursor {
    config: Config,
    location: ffi::OsString,
    alias: String,
    fh: Option<FileHandle>,
    header: header::Header,
    fields: Vec<FieldInfo>,
    memo: Option<MemoFile>,
    indexes: Vec<CdxFile>,
    selected: Option<(usize, usize)>,
    record: Vec<u8>,
    record_old: Vec<u8>,
    blank: Vec<u8>,
    recno: u32,
    bof: bool,
    eof: bool,
    dirty: bool,
    found: bool,
    journal: Journal,
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(target: "dbf", "close {:?} on drop {}", self.location, err);
        }
    }
}

impl Cursor {
    /// Open an existing data file for shared read-write access. The
    /// `.dbf` extension is assumed when `path` carries none. When the
    /// schema has memo fields and the `.fpt` sibling exists it is
    /// attached; a missing memo sibling is not an error. With
    /// [Config::auto_open] the production index is attached and its
    /// first tag selected.
    pub fn open(config: Config, path: &str) -> Result<Cursor> {
        let location = with_default_extension(path, "dbf");
        let mut fh = FileHandle::open(&location, AccessMode::DenyNone)?;
        let (hdr, fields) = header::load(&mut fh)?;

        let blank = blank_record(&hdr, &fields);
        let mut cursor = Cursor {
            config,
            alias: alias_of(&location),
            location: location.clone(),
            fh: Some(fh),
            header: hdr,
            fields,
            memo: None,
            indexes: vec![],
            selected: None,
            record: blank.clone(),
            record_old: blank.clone(),
            blank,
            recno: 0,
            bof: true,
            eof: true,
            dirty: false,
            found: false,
            journal: Journal::default(),
        };

        if cursor.has_memo_fields() {
            let sibling = sibling_path(&location, "fpt");
            if path::Path::new(&sibling).exists() {
                match MemoFile::open(&sibling, AccessMode::DenyNone) {
                    Ok(memo) => cursor.memo = Some(memo),
                    // memo reads fall back to the raw reference bytes.
                    Err(err) => debug!(target: "dbf", "memo {:?} skipped {}", sibling, err),
                }
            }
        }

        if cursor.config.auto_open {
            let ext = cursor.config.index_extension.clone();
            let sibling = sibling_path(&location, &ext);
            if path::Path::new(&sibling).exists() {
                match CdxFile::open(&sibling) {
                    Ok(cdx) => {
                        cursor.indexes.push(cdx);
                        cursor.selected = Some((0, 0));
                    }
                    Err(err) => debug!(target: "dbf", "index {:?} skipped {}", sibling, err),
                }
            }
        }

        cursor.set_boundary_state();
        Ok(cursor)
    }

    /// Lay out a new data file from a schema, honoring
    /// [Config::safety], [Config::create_temp], [Config::compatibility]
    /// and [Config::code_page]. A schema with memo fields gets a fresh
    /// memo sibling as well.
    pub fn create(config: Config, path: &str, fields: Vec<FieldInfo>) -> Result<Cursor> {
        if fields.is_empty() {
            err_at!(BadFormat, msg: "schema without fields")?;
        }

        let location = with_default_extension(path, "dbf");
        let has_memo = fields.iter().any(|f| f.typ == FieldType::Memo);

        let hdr = {
            let record_len = 1 + fields.iter().map(|f| f.length as u64).sum::<u64>();
            let record_len = err_at!(FailConvert, u16::try_from(record_len))?;
            let header_len = header::HEADER_SIZE + header::DESCRIPTOR_SIZE * fields.len() + 1;
            let header_len = err_at!(FailConvert, u16::try_from(header_len))?;

            let version = match (config.compatibility, has_memo) {
                (30, _) => header::Version::VisualFoxPro,
                (_, false) => header::Version::DBase3,
                (_, true) => header::Version::DBase4Memo,
            };

            header::Header {
                version,
                updated: util::today(),
                n_records: 0,
                header_len,
                record_len,
                code_page: header::CodePage::from_page_number(config.code_page),
            }
        };

        let mut fields = fields;
        header::seal_layout(&hdr, &mut fields)?;

        let mut fh = FileHandle::create(&location, config.safety, config.create_temp)?;
        header::store(&mut fh, &hdr, &fields)?;
        fh.flush()?;

        let memo = if has_memo {
            let sibling = sibling_path(&location, "fpt");
            Some(MemoFile::create(&sibling, config.safety, config.create_temp)?)
        } else {
            None
        };

        debug!(target: "dbf", "created {:?} fields:{}", location, fields.len());

        let blank = blank_record(&hdr, &fields);
        Ok(Cursor {
            config,
            alias: alias_of(&location),
            location,
            fh: Some(fh),
            header: hdr,
            fields,
            memo,
            indexes: vec![],
            selected: None,
            record: blank.clone(),
            record_old: blank.clone(),
            blank,
            recno: 0,
            bof: true,
            eof: true,
            dirty: false,
            found: false,
            journal: Journal::default(),
        })
    }

    /// Flush everything, release locks and drop the memo and index
    /// siblings. Closing an already closed cursor is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.fh.is_none() {
            return Ok(());
        }
        self.flush()?;

        self.indexes.clear();
        self.selected = None;
        self.memo = None;
        self.fh = None; // drop releases registry locks
        self.recno = 0;
        self.bof = true;
        self.eof = true;
        self.dirty = false;

        debug!(target: "dbf", "closed {:?}", self.location);
        Ok(())
    }
}

impl Cursor {
    pub fn is_open(&self) -> bool {
        self.fh.is_some()
    }

    pub fn to_location(&self) -> ffi::OsString {
        self.location.clone()
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn set_alias(&mut self, alias: &str) {
        self.alias = alias.to_string();
    }

    pub fn header(&self) -> &header::Header {
        &self.header
    }

    pub fn record_count(&self) -> u32 {
        match self.fh {
            Some(_) => self.header.n_records,
            None => 0,
        }
    }

    pub fn record_len(&self) -> u16 {
        self.header.record_len
    }

    /// Current record number, 1-based. Zero before the first record
    /// and `count + 1` after the last.
    pub fn position(&self) -> u32 {
        self.recno
    }

    pub fn bof(&self) -> bool {
        self.bof
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Whether the last seek landed on a match.
    pub fn found(&self) -> bool {
        self.found
    }

    pub fn deleted(&self) -> bool {
        self.record.first() == Some(&TOMBSTONE_DELETED)
    }

    pub fn in_transaction(&self) -> bool {
        self.journal.is_active()
    }

    /// Raw bytes of the current record, tombstone included.
    pub fn record(&self) -> &[u8] {
        &self.record
    }

    /// The current record as loaded from disk, before in-memory edits.
    pub fn record_old(&self) -> &[u8] {
        &self.record_old
    }
}

impl Cursor {
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Resolve a field by name, case-insensitive. None distinguishes
    /// a missing field from a field whose value is blank.
    pub fn field(&self, name: &str) -> Option<Field> {
        let name = name.trim();
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
            .map(Field)
    }

    /// Resolve a field by position, 0-based.
    pub fn field_at(&self, index: usize) -> Option<Field> {
        if index < self.fields.len() {
            Some(Field(index))
        } else {
            None
        }
    }

    pub fn field_info(&self, field: Field) -> Option<&FieldInfo> {
        self.fields.get(field.0)
    }

    fn cell(&self, field: Field) -> &[u8] {
        let info = &self.fields[field.0];
        &self.record[info.offset..info.offset + info.length as usize]
    }

    fn cell_mut(&mut self, field: Field) -> &mut [u8] {
        let info = &self.fields[field.0];
        let (start, end) = (info.offset, info.offset + info.length as usize);
        &mut self.record[start..end]
    }

    /// Field value as text. Character cells keep their padding, memo
    /// cells resolve through the memo file when one is attached and
    /// fall back to the raw block-reference bytes otherwise.
    pub fn as_string(&mut self, field: Field) -> Result<String> {
        let info = match self.fields.get(field.0) {
            Some(info) => info,
            None => err_at!(Fatal, msg: "no such field slot {}", field.0)?,
        };

        if info.typ == FieldType::Memo {
            if let Some(block) = field::decode_memo_ref(self.cell(field)) {
                if let Some(memo) = self.memo.as_mut() {
                    if let Some(text) = memo.read(block)? {
                        return Ok(text);
                    }
                }
            }
        }
        Ok(field::decode_str(self.cell(field)))
    }

    pub fn as_int(&self, field: Field) -> Result<i64> {
        self.field_info(field)
            .map(|_| field::decode_int(self.cell(field)))
            .ok_or_else(|| no_such_field(field))
    }

    pub fn as_float(&self, field: Field) -> Result<f64> {
        self.field_info(field)
            .map(|_| field::decode_float(self.cell(field)))
            .ok_or_else(|| no_such_field(field))
    }

    pub fn as_bool(&self, field: Field) -> Result<bool> {
        self.field_info(field)
            .map(|_| field::decode_bool(self.cell(field)))
            .ok_or_else(|| no_such_field(field))
    }

    pub fn as_date(&self, field: Field) -> Result<util::Date> {
        let info = match self.field_info(field) {
            Some(info) => info,
            None => return Err(no_such_field(field)),
        };
        let date = match info.typ {
            // datetime cells are textual, the leading token is the date.
            FieldType::DateTime => {
                let text = field::decode_str(self.cell(field));
                match text.split_whitespace().next() {
                    Some(token) => util::Date::parse(token).unwrap_or_else(util::Date::empty),
                    None => util::Date::empty(),
                }
            }
            _ => field::decode_date(self.cell(field)),
        };
        Ok(date)
    }

    /// The natural variant for the field's type.
    pub fn value(&mut self, field: Field) -> Result<Value> {
        let info = match self.fields.get(field.0) {
            Some(info) => info.clone(),
            None => return Err(no_such_field(field)),
        };

        let value = match info.typ {
            FieldType::Character => Value::Char(field::decode_str(self.cell(field))),
            FieldType::Numeric | FieldType::Float | FieldType::Currency => {
                Value::Num(field::decode_float(self.cell(field)))
            }
            FieldType::Integer => Value::Int(field::decode_int(self.cell(field))),
            FieldType::Logical => Value::Bool(field::decode_bool(self.cell(field))),
            FieldType::Date => Value::Date(field::decode_date(self.cell(field))),
            FieldType::DateTime => Value::DateTime(field::decode_str(self.cell(field))),
            FieldType::Memo => Value::Memo(self.as_string(field)?),
            FieldType::Other(_) => Value::Bytes(self.cell(field).to_vec()),
        };
        Ok(value)
    }

    /// True when the field is declared nullable and its storage is
    /// blank.
    pub fn is_null(&self, field: Field) -> Result<bool> {
        match self.field_info(field) {
            Some(info) => Ok(info.nullable && field::is_blank(self.cell(field))),
            None => Err(no_such_field(field)),
        }
    }

    /// Assign text to a field, canonicalized per the field type.
    /// Unparseable numeric or date input blanks the cell without an
    /// error; numeric overflow fills the cell with `*`.
    pub fn assign(&mut self, field: Field, text: &str) -> Result<()> {
        let info = match self.fields.get(field.0) {
            Some(info) => info.clone(),
            None => return Err(no_such_field(field)),
        };

        if info.typ == FieldType::Memo {
            let block = match self.memo.as_mut() {
                Some(memo) => memo.write(text.as_bytes())?,
                None => err_at!(IoWrite, msg: "memo file unavailable for {:?}", info.name)?,
            };
            field::encode_memo_ref(self.cell_mut(field), block);
        } else {
            field::encode(self.cell_mut(field), info.typ, info.decimals, text);
        }
        self.dirty = true;
        Ok(())
    }

    pub fn assign_f64(&mut self, field: Field, value: f64) -> Result<()> {
        let decimals = match self.fields.get(field.0) {
            Some(info) => match info.typ {
                FieldType::Currency => 4,
                _ => info.decimals,
            },
            None => return Err(no_such_field(field)),
        };
        self.assign(field, &format!("{:.*}", decimals as usize, value))
    }

    pub fn assign_i64(&mut self, field: Field, value: i64) -> Result<()> {
        self.assign(field, &value.to_string())
    }

    pub fn assign_bool(&mut self, field: Field, value: bool) -> Result<()> {
        self.assign(field, if value { "T" } else { "F" })
    }

    pub fn assign_date(&mut self, field: Field, value: util::Date) -> Result<()> {
        self.assign(field, &value.to_yyyymmdd())
    }

    /// Blank one cell, spaces for most types and `F` for logicals.
    pub fn blank_field(&mut self, field: Field) -> Result<()> {
        let info = match self.fields.get(field.0) {
            Some(info) => info.clone(),
            None => return Err(no_such_field(field)),
        };
        let cell = self.cell_mut(field);
        for b in cell.iter_mut() {
            *b = b' ';
        }
        if info.typ == FieldType::Logical {
            cell[0] = b'F';
        }
        self.dirty = true;
        Ok(())
    }

    /// Copy the blank template over the current record.
    pub fn blank(&mut self) {
        self.record.copy_from_slice(&self.blank);
        self.dirty = true;
    }
}

impl Cursor {
    /// Load record `n`, failing with [Error::BadRecord] outside
    /// `1..=count`.
    pub fn goto(&mut self, n: u32) -> Result<()> {
        if n < 1 || n > self.header.n_records {
            err_at!(BadRecord, msg: "record {}/{}", n, self.header.n_records)?;
        }
        self.load_record(n)
    }

    pub fn first(&mut self) -> Result<()> {
        if let Some((i, t)) = self.selected {
            return match self.indexes[i].tag_first(t)? {
                Some(recno) => self.load_record(recno),
                None => Ok(self.set_empty_state()),
            };
        }
        match self.header.n_records {
            0 => Ok(self.set_empty_state()),
            _ => self.load_record(1),
        }
    }

    pub fn last(&mut self) -> Result<()> {
        if let Some((i, t)) = self.selected {
            return match self.indexes[i].tag_last(t)? {
                Some(recno) => self.load_record(recno),
                None => Ok(self.set_empty_state()),
            };
        }
        match self.header.n_records {
            0 => Ok(self.set_empty_state()),
            n => self.load_record(n),
        }
    }

    pub fn next(&mut self) -> Result<()> {
        self.skip(1)
    }

    pub fn previous(&mut self) -> Result<()> {
        self.skip(-1)
    }

    /// Move `k` records relative to the current position, key order
    /// when a tag is selected and physical order otherwise. Crossing
    /// a boundary parks the cursor at before-first or after-last
    /// without an error.
    pub fn skip(&mut self, k: i64) -> Result<()> {
        if self.fh.is_none() {
            err_at!(BadRecord, msg: "cursor is closed")?;
        }
        if self.selected.is_some() {
            return self.skip_keyed(k);
        }

        if k == 0 {
            return self.refresh();
        }
        let target = (self.recno as i64) + k;
        if target < 1 {
            self.recno = 0;
            self.bof = true;
            self.eof = false;
            return Ok(());
        }
        if target > self.header.n_records as i64 {
            self.recno = self.header.n_records + 1;
            self.bof = false;
            self.eof = true;
            return Ok(());
        }
        self.load_record(target as u32)
    }

    // keyed variant of skip, walking the selected tag's leaf chain.
    fn skip_keyed(&mut self, k: i64) -> Result<()> {
        let (i, t) = self.selected.unwrap();
        if k == 0 {
            return self.refresh();
        }

        let mut landed = None;
        for _step in 0..k.abs() {
            let hop = if k > 0 {
                self.indexes[i].tag_next(t)?
            } else {
                self.indexes[i].tag_previous(t)?
            };
            match hop {
                Some(recno) => landed = Some(recno),
                None if k > 0 => {
                    if let Some(recno) = landed {
                        self.load_record(recno)?;
                    }
                    self.recno = self.header.n_records + 1;
                    self.bof = false;
                    self.eof = true;
                    return Ok(());
                }
                None => {
                    if let Some(recno) = landed {
                        self.load_record(recno)?;
                    }
                    self.recno = 0;
                    self.bof = true;
                    self.eof = false;
                    return Ok(());
                }
            }
        }
        match landed {
            Some(recno) => self.load_record(recno),
            None => Ok(()),
        }
    }

    /// Re-read the current record from disk, discarding in-memory
    /// edits. A no-op at the boundary states.
    pub fn refresh(&mut self) -> Result<()> {
        match self.recno {
            0 => Ok(()),
            n if n > self.header.n_records => Ok(()),
            n => self.load_record(n),
        }
    }

    /// Physical position as a fraction of the record count.
    pub fn position_fraction(&self) -> f64 {
        let count = self.header.n_records;
        if count == 0 || self.bof || self.recno == 0 {
            return 0.0;
        }
        if self.eof {
            return 1.0;
        }
        (self.recno as f64) / (count as f64)
    }

    /// Position at the record nearest the fraction, clamped to
    /// `[0, 1]`.
    pub fn set_position_fraction(&mut self, fraction: f64) -> Result<()> {
        let count = self.header.n_records;
        if count == 0 {
            return Ok(self.set_empty_state());
        }
        let fraction = fraction.max(0.0).min(1.0);
        let target = ((fraction * count as f64).round() as u32).clamp(1, count);
        self.load_record(target)
    }
}

impl Cursor {
    /// Extend the file by one blank record and position on it.
    pub fn append(&mut self) -> Result<()> {
        if self.fh.is_none() {
            err_at!(IoWrite, msg: "cursor is closed")?;
        }

        let recno = self.header.n_records + 1;
        self.header.n_records = recno;
        self.header.updated = util::today();

        self.record.copy_from_slice(&self.blank);
        self.record_old.copy_from_slice(&self.blank);
        self.recno = recno;
        self.bof = recno == 1;
        self.eof = false;

        let pos = self.header.record_pos(recno);
        let fh = self.fh.as_mut().unwrap();
        fh.write_at(pos, &self.record)?;
        header::store_header(fh, &self.header)?;

        self.journal.log(Entry::Append { recno });
        self.mark_indexes_stale();
        self.dirty = false;
        Ok(())
    }

    /// Soft-delete the current record, flipping its tombstone on disk.
    pub fn delete(&mut self) -> Result<()> {
        self.positioned()?;
        if self.deleted() {
            return Ok(());
        }

        self.journal.log(Entry::Delete { recno: self.recno });
        self.record[0] = TOMBSTONE_DELETED;
        let pos = self.header.record_pos(self.recno);
        self.fh.as_mut().unwrap().write_at(pos, &[TOMBSTONE_DELETED])?;
        self.record_old[0] = TOMBSTONE_DELETED;
        self.mark_indexes_stale();
        Ok(())
    }

    /// Clear the tombstone of the current record on disk.
    pub fn recall(&mut self) -> Result<()> {
        self.positioned()?;
        if !self.deleted() {
            return Ok(());
        }

        if self.journal.is_active() {
            let old = self.disk_record()?;
            self.journal.log(Entry::Update { recno: self.recno, old });
        }
        self.record[0] = TOMBSTONE_LIVE;
        let pos = self.header.record_pos(self.recno);
        self.fh.as_mut().unwrap().write_at(pos, &[TOMBSTONE_LIVE])?;
        self.record_old[0] = TOMBSTONE_LIVE;
        self.mark_indexes_stale();
        Ok(())
    }

    /// Write the in-memory record buffer to the file at the current
    /// position.
    pub fn write(&mut self) -> Result<()> {
        self.positioned()?;

        if self.journal.is_active() {
            let old = self.record_old.clone();
            self.journal.log(Entry::Update { recno: self.recno, old });
        }

        self.header.updated = util::today();
        let pos = self.header.record_pos(self.recno);
        self.fh.as_mut().unwrap().write_at(pos, &self.record)?;
        self.record_old.copy_from_slice(&self.record);
        self.dirty = false;
        self.mark_indexes_stale();
        Ok(())
    }

    /// Replace the whole current record with the given bytes.
    pub fn replace(&mut self, source: &[u8]) -> Result<()> {
        self.positioned()?;
        if source.len() < self.record.len() {
            err_at!(BadRecord, msg: "source {}/{} bytes", source.len(), self.record.len())?;
        }
        let n = self.record.len();
        self.record.copy_from_slice(&source[..n]);
        self.dirty = true;
        self.write()
    }

    /// Flush the data file and, when present, the memo file.
    pub fn flush(&mut self) -> Result<()> {
        let fh = match self.fh.as_mut() {
            Some(fh) => fh,
            None => return Ok(()),
        };
        header::store_header(fh, &self.header)?;
        fh.flush()?;
        if let Some(memo) = self.memo.as_mut() {
            memo.flush()?;
        }
        Ok(())
    }

    /// Soft-delete a run of records, the whole file when `n_recs` is
    /// zero. Zapping the whole file also resets the record count,
    /// which is refused while a transaction is active.
    pub fn zap(&mut self, start: u32, n_recs: u32) -> Result<()> {
        let count = self.header.n_records;
        let (start, end) = match n_recs {
            0 => (1, count),
            n => (start, (start + n - 1).min(count)),
        };
        if start < 1 || start > count {
            err_at!(BadRecord, msg: "zap start {}/{}", start, count)?;
        }

        let zap_all = start == 1 && end == count;
        if zap_all && self.journal.is_active() {
            err_at!(Fatal, msg: "zap-all inside a transaction")?;
        }

        for recno in start..=end {
            self.goto(recno)?;
            self.delete()?;
        }

        if zap_all {
            self.header.n_records = 0;
            let fh = self.fh.as_mut().unwrap();
            header::store_header(fh, &self.header)?;
            self.set_empty_state();
        }
        self.flush()
    }

    /// Deterministic rewrite that drops deleted records: live records
    /// are copied down, the header count rewritten and the file
    /// truncated, then the cursor repositions on the first record.
    /// Attached tags are marked stale, [Cursor::reindex] is the
    /// documented precondition for further keyed access.
    pub fn pack(&mut self) -> Result<()> {
        if self.journal.is_active() {
            err_at!(Fatal, msg: "pack inside a transaction")?;
        }
        if self.fh.is_none() {
            err_at!(IoWrite, msg: "cursor is closed")?;
        }

        let count = self.header.n_records;
        let mut kept = 0_u32;
        for recno in 1..=count {
            self.load_record(recno)?;
            if self.deleted() {
                continue;
            }
            kept += 1;
            if kept != recno {
                let pos = self.header.record_pos(kept);
                self.fh.as_mut().unwrap().write_at(pos, &self.record)?;
            }
        }

        self.header.n_records = kept;
        self.header.updated = util::today();
        let fh = self.fh.as_mut().unwrap();
        fh.truncate(self.header.file_len())?;
        header::store_header(fh, &self.header)?;
        fh.flush()?;

        debug!(target: "dbf", "packed {:?} {} -> {} records", self.location, count, kept);

        self.mark_indexes_stale();
        match kept {
            0 => {
                self.set_empty_state();
                Ok(())
            }
            _ => self.load_record(1),
        }
    }
}

impl Cursor {
    /// Start a transaction; a begin inside an active transaction is a
    /// no-op.
    pub fn begin(&mut self) {
        self.journal.begin();
    }

    /// Flush all modified state and discard the journal.
    pub fn commit(&mut self) -> Result<()> {
        if self.dirty && self.recno >= 1 && self.recno <= self.header.n_records {
            self.write()?;
        }
        self.flush()?;
        let n = self.journal.commit();
        debug!(target: "dbf", "commit {:?} entries:{}", self.location, n);
        Ok(())
    }

    /// Replay the journal newest to oldest, restoring the byte-exact
    /// pre-transaction content of the data file.
    pub fn rollback(&mut self) -> Result<()> {
        let entries = self.journal.rollback();
        let n = entries.len();

        for entry in entries {
            match entry {
                Entry::Append { recno } => {
                    self.header.n_records = self.header.n_records.min(recno - 1);
                }
                Entry::Update { recno, old } => {
                    let pos = self.header.record_pos(recno);
                    self.fh.as_mut().unwrap().write_at(pos, &old)?;
                }
                Entry::Delete { recno } => {
                    let pos = self.header.record_pos(recno);
                    self.fh.as_mut().unwrap().write_at(pos, &[TOMBSTONE_LIVE])?;
                }
            }
        }

        let fh = self.fh.as_mut().unwrap();
        header::store_header(fh, &self.header)?;
        fh.flush()?;
        self.dirty = false;
        self.mark_indexes_stale();

        // the buffers may hold rolled-back bytes.
        if self.recno >= 1 && self.recno <= self.header.n_records {
            self.load_record(self.recno)?;
        } else if self.recno > self.header.n_records {
            self.recno = self.header.n_records + 1;
            self.bof = false;
            self.eof = true;
        }

        debug!(target: "dbf", "rollback {:?} entries:{}", self.location, n);
        Ok(())
    }
}

impl Cursor {
    pub fn lock_file(&self) -> Result<()> {
        lock::lock_file(self.fh_ref()?)
    }

    pub fn unlock_file(&self) -> Result<()> {
        lock::unlock_file(self.fh_ref()?)
    }

    /// Lock the byte range of the current record.
    pub fn lock_record(&self) -> Result<()> {
        self.positioned()?;
        let pos = self.header.record_pos(self.recno);
        lock::lock_range(self.fh_ref()?, pos, self.header.record_len as u64)
    }

    pub fn unlock_record(&self) -> Result<()> {
        self.positioned()?;
        let pos = self.header.record_pos(self.recno);
        lock::unlock_range(self.fh_ref()?, pos)
    }

    pub fn is_record_locked(&self) -> bool {
        match (self.fh.as_ref(), self.recno) {
            (Some(fh), n) if n >= 1 => {
                lock::is_locked(fh, self.header.record_pos(n))
            }
            _ => false,
        }
    }

    /// Lock the data file and every attached index file as one atomic
    /// set.
    pub fn lock_all(&self) -> Result<()> {
        let mut files = vec![self.fh_ref()?];
        files.extend(self.indexes.iter().map(|cdx| cdx.as_fh()));
        lock::lock_all(&files)
    }

    pub fn unlock_all(&self) -> Result<()> {
        let mut files = vec![self.fh_ref()?];
        files.extend(self.indexes.iter().map(|cdx| cdx.as_fh()));
        lock::unlock_all(&files)
    }
}

impl Cursor {
    /// Attach a compound index. Without a path the production index,
    /// the one sharing the data file's stem, is tried.
    pub fn attach_index(&mut self, path: Option<&str>) -> Result<()> {
        let location = self.index_location(path);
        let cdx = CdxFile::open(&location)?;
        self.indexes.push(cdx);
        Ok(())
    }

    /// Create a compound index over this cursor's schema and attach
    /// it, building every tag's tree. Without a path the production
    /// stem is used.
    pub fn create_index(&mut self, path: Option<&str>, specs: &[TagSpec]) -> Result<()> {
        let location = self.index_location(path);

        let mut layouts = vec![];
        for spec in specs.iter() {
            let (key_type, key_len) = self.derive_key_layout(&spec.expression)?;
            layouts.push((spec.clone(), key_type, key_len));
        }

        let cdx = CdxFile::create(
            &location,
            &layouts,
            self.config.collating_sequence,
            self.config.safety,
            self.config.create_temp,
        )?;
        self.indexes.push(cdx);
        self.reindex()?;
        Ok(())
    }

    pub fn n_indexes(&self) -> usize {
        self.indexes.len()
    }

    /// Every tag across the attached indexes.
    pub fn tags(&self) -> Vec<&Tag> {
        self.indexes.iter().flat_map(|cdx| cdx.tags().iter()).collect()
    }

    /// Metadata of a tag by name, case-insensitive across all
    /// attached indexes.
    pub fn tag(&self, name: &str) -> Option<&Tag> {
        self.find_tag(name).map(|(i, t)| self.indexes[i].tag(t).unwrap())
    }

    /// Select the tag ordering navigation and seek, case-insensitive.
    pub fn select_tag(&mut self, name: &str) -> Result<()> {
        match self.find_tag(name) {
            Some(slot) => {
                self.selected = Some(slot);
                Ok(())
            }
            None => err_at!(IndexError, msg: "no tag {:?}", name),
        }
    }

    pub fn selected_tag(&self) -> Option<&Tag> {
        let (i, t) = self.selected?;
        self.indexes[i].tag(t)
    }

    /// Back to physical record order.
    pub fn clear_tag_selection(&mut self) {
        self.selected = None;
    }

    fn find_tag(&self, name: &str) -> Option<(usize, usize)> {
        for (i, cdx) in self.indexes.iter().enumerate() {
            if let Some(t) = cdx.tag_by_name(name) {
                return Some((i, t));
            }
        }
        None
    }

    /// Rebuild every tag of every attached index from the data file.
    /// Deleted records, records excluded by a tag's filter and records
    /// whose key expression evaluates empty are left out of the tree.
    pub fn reindex(&mut self) -> Result<()> {
        for i in 0..self.indexes.len() {
            for t in 0..self.indexes[i].n_tags() {
                let tag = self.indexes[i].tag(t).unwrap().clone();
                let pairs = self.collect_tag_pairs(&tag)?;
                self.indexes[i].rebuild(t, pairs)?;
            }
        }
        Ok(())
    }

    // evaluate one tag's expression over every live record.
    fn collect_tag_pairs(&mut self, tag: &Tag) -> Result<Vec<(Vec<u8>, u32)>> {
        let parsed = expr::parse(tag.expression());
        let filter = match tag.filter() {
            "" => None,
            src => expr::parse(src),
        };

        let count = self.header.n_records;
        let mut pairs = vec![];
        let mut buf = vec![0_u8; self.header.record_len as usize];

        for recno in 1..=count {
            let pos = self.header.record_pos(recno);
            let fh = self.fh.as_mut().unwrap();
            let n = fh.read_at(pos, &mut buf)?;
            if n < buf.len() {
                err_at!(IoRead, msg: "record {} short read {}/{}", recno, n, buf.len())?;
            }
            if buf[0] == TOMBSTONE_DELETED {
                continue;
            }

            let view = RecordView {
                fields: &self.fields,
                record: &buf,
                recno,
                count,
            };
            if let Some(filter) = filter.as_ref() {
                match expr::evaluate(filter, &view) {
                    Some(ExprValue::Bool(true)) => (),
                    Some(ExprValue::Num(n)) if n != 0.0 => (),
                    _ => continue,
                }
            }
            let value = match parsed.as_ref().and_then(|e| expr::evaluate(e, &view)) {
                Some(value) => value,
                None => continue, // empty key
            };
            if let Some(key) = tag.format_key(&value) {
                pairs.push((key, recno));
            }
        }

        Ok(pairs)
    }

    // static layout of a key expression against this schema, the way
    // index creation sizes its keys.
    fn derive_key_layout(&self, src: &str) -> Result<(KeyType, usize)> {
        let parsed = match expr::parse(src) {
            Some(parsed) => parsed,
            None => err_at!(IndexError, msg: "key expression {:?}", src)?,
        };
        match self.layout_of(&parsed) {
            Some(layout) => Ok(layout),
            None => err_at!(IndexError, msg: "cannot size key {:?}", src),
        }
    }

    fn layout_of(&self, parsed: &Expr) -> Option<(KeyType, usize)> {
        const NUMERIC_KEY_LEN: usize = 12;

        match parsed {
            Expr::Field(name) => {
                let field = self.field(name)?;
                let info = &self.fields[field.0];
                match info.typ {
                    FieldType::Numeric
                    | FieldType::Float
                    | FieldType::Integer
                    | FieldType::Currency => Some((KeyType::Num, NUMERIC_KEY_LEN)),
                    FieldType::Date => Some((KeyType::Date, 8)),
                    FieldType::Logical => Some((KeyType::Logical, 1)),
                    _ => Some((KeyType::Char, info.length as usize)),
                }
            }
            Expr::StrLit(text) => Some((KeyType::Char, text.len().max(1))),
            Expr::NumLit(_) => Some((KeyType::Num, NUMERIC_KEY_LEN)),
            Expr::Binary('+', lhs, rhs) => {
                match (self.layout_of(lhs)?, self.layout_of(rhs)?) {
                    ((KeyType::Char, a), (KeyType::Char, b)) => Some((KeyType::Char, a + b)),
                    ((KeyType::Num, _), (KeyType::Num, _)) => {
                        Some((KeyType::Num, NUMERIC_KEY_LEN))
                    }
                    _ => None,
                }
            }
            Expr::Binary(_, _, _) => Some((KeyType::Num, NUMERIC_KEY_LEN)),
            Expr::Call(name, args) => match name.as_str() {
                "DTOS" => Some((KeyType::Char, 8)),
                "STR" => Some((KeyType::Char, 10)),
                "UPPER" | "LOWER" | "ALLTRIM" | "TRIM" | "LTRIM" => self.layout_of(&args[0]),
                "LEFT" | "RIGHT" | "SUBSTR" => {
                    let (_, len) = self.layout_of(&args[0])?;
                    Some((KeyType::Char, len))
                }
                "YEAR" | "MONTH" | "DAY" | "VAL" | "INT" | "ABS" | "RECNO" | "RECCOUNT" => {
                    Some((KeyType::Num, NUMERIC_KEY_LEN))
                }
                "DELETED" => Some((KeyType::Logical, 1)),
                "IIF" => self.layout_of(&args[1]),
                _ => None,
            },
        }
    }
}

impl Cursor {
    /// Seek a typed value through the selected tag, [SeekResult] is
    /// the three-way outcome and the cursor lands per its contract.
    pub fn seek(&mut self, value: &Value) -> Result<SeekResult> {
        let value = match value {
            Value::Char(s) | Value::DateTime(s) | Value::Memo(s) => {
                ExprValue::Str(s.clone())
            }
            Value::Num(n) => ExprValue::Num(*n),
            Value::Int(n) => ExprValue::Num(*n as f64),
            Value::Bool(b) => ExprValue::Bool(*b),
            Value::Date(d) => ExprValue::Date(*d),
            Value::Bytes(b) => ExprValue::Str(util::cell_str(b)),
        };
        self.seek_value(&value, None)
    }

    pub fn seek_str(&mut self, value: &str) -> Result<SeekResult> {
        self.seek_value(&ExprValue::Str(value.to_string()), None)
    }

    pub fn seek_f64(&mut self, value: f64) -> Result<SeekResult> {
        self.seek_value(&ExprValue::Num(value), None)
    }

    pub fn seek_i64(&mut self, value: i64) -> Result<SeekResult> {
        self.seek_value(&ExprValue::Num(value as f64), None)
    }

    /// Partial seek, comparing only the first `len` bytes of the
    /// formatted key.
    pub fn seek_n(&mut self, value: &str, len: usize) -> Result<SeekResult> {
        self.seek_value(&ExprValue::Str(value.to_string()), Some(len))
    }

    /// Advance past the current record when it already matches, then
    /// re-test; a non-match after the advance yields [SeekResult::After].
    pub fn seek_next(&mut self, value: &str) -> Result<SeekResult> {
        let (i, t) = match self.selected {
            Some(slot) => slot,
            None => err_at!(IndexError, msg: "no tag selected")?,
        };

        let tag = self.indexes[i].tag(t).unwrap();
        let cmp_len = tag.key_len();
        let search = match tag.format_key(&ExprValue::Str(value.to_string())) {
            Some(key) => key,
            None => vec![b' '; cmp_len],
        };

        let state = tag.state().clone();
        let on_match = !state.bof && !state.eof && state.key == search;
        if !on_match {
            return self.seek_str(value);
        }

        match self.indexes[i].tag_next(t)? {
            None => {
                self.found = false;
                self.recno = self.header.n_records + 1;
                self.bof = false;
                self.eof = true;
                Ok(SeekResult::Eof)
            }
            Some(recno) => {
                self.load_record(recno)?;
                let still = self.indexes[i].tag(t).unwrap().state().key == search;
                self.found = still;
                Ok(if still { SeekResult::Success } else { SeekResult::After })
            }
        }
    }

    fn seek_value(&mut self, value: &ExprValue, len: Option<usize>) -> Result<SeekResult> {
        let (i, t) = match self.selected {
            Some(slot) => slot,
            None => err_at!(IndexError, msg: "no tag selected")?,
        };

        let tag = self.indexes[i].tag(t).unwrap();
        let key_len = tag.key_len();
        // an unformattable value searches as the empty key, it cannot
        // match but traversal still lands deterministically.
        let search = tag.format_key(value).unwrap_or_else(|| vec![b' '; key_len]);
        let cmp_len = len.unwrap_or(key_len).min(key_len);

        let result = self.indexes[i].tag_seek(t, &search, cmp_len)?;
        self.found = result.is_match();
        match result {
            SeekResult::Eof => {
                self.recno = self.header.n_records + 1;
                self.bof = false;
                self.eof = true;
            }
            _ => {
                let recno = self.indexes[i].tag(t).unwrap().state().recno;
                self.load_record(recno)?;
            }
        }
        Ok(result)
    }

    /// Logical text of the selected tag's current key.
    pub fn current_key(&self) -> Option<String> {
        let tag = self.selected_tag()?;
        let state = tag.state();
        if state.bof || state.eof {
            return None;
        }
        Some(tag.unformat_key(&state.key))
    }

    /// Record number under the selected tag's cursor.
    pub fn tag_recno(&self) -> Option<u32> {
        let state = self.selected_tag()?.state();
        match state.recno {
            0 => None,
            recno => Some(recno),
        }
    }

    pub fn tag_eof(&self) -> bool {
        self.selected_tag().map(|tag| tag.state().eof).unwrap_or(true)
    }

    pub fn tag_bof(&self) -> bool {
        self.selected_tag().map(|tag| tag.state().bof).unwrap_or(true)
    }

    /// Rank of the selected tag's current key as a fraction in
    /// `[0, 1]`.
    pub fn tag_position(&mut self) -> Result<f64> {
        let (i, t) = match self.selected {
            Some(slot) => slot,
            None => err_at!(IndexError, msg: "no tag selected")?,
        };
        self.indexes[i].tag_position(t)
    }

    /// Position the selected tag, and the cursor, at the key whose
    /// rank best matches the fraction.
    pub fn tag_set_position(&mut self, fraction: f64) -> Result<()> {
        let (i, t) = match self.selected {
            Some(slot) => slot,
            None => err_at!(IndexError, msg: "no tag selected")?,
        };
        match self.indexes[i].tag_set_position(t, fraction)? {
            Some(recno) => self.load_record(recno),
            None => Ok(self.set_empty_state()),
        }
    }
}

impl Cursor {
    fn fh_ref(&self) -> Result<&FileHandle> {
        match self.fh.as_ref() {
            Some(fh) => Ok(fh),
            None => err_at!(IoOpen, msg: "cursor is closed"),
        }
    }

    fn positioned(&self) -> Result<()> {
        if self.fh.is_none() {
            err_at!(BadRecord, msg: "cursor is closed")?;
        }
        if self.recno < 1 || self.recno > self.header.n_records {
            err_at!(BadRecord, msg: "record {}/{}", self.recno, self.header.n_records)?;
        }
        Ok(())
    }

    fn has_memo_fields(&self) -> bool {
        self.fields.iter().any(|f| f.typ == FieldType::Memo)
    }

    fn load_record(&mut self, recno: u32) -> Result<()> {
        let pos = self.header.record_pos(recno);
        let fh = match self.fh.as_mut() {
            Some(fh) => fh,
            None => err_at!(IoRead, msg: "cursor is closed")?,
        };
        let n = fh.read_at(pos, &mut self.record)?;
        if n < self.record.len() {
            err_at!(IoRead, msg: "record {} short read {}/{}", recno, n, self.record.len())?;
        }
        self.record_old.copy_from_slice(&self.record);
        self.recno = recno;
        self.bof = recno == 1;
        self.eof = false;
        self.dirty = false;
        Ok(())
    }

    fn disk_record(&mut self) -> Result<Vec<u8>> {
        let pos = self.header.record_pos(self.recno);
        let mut buf = vec![0_u8; self.header.record_len as usize];
        let fh = self.fh.as_mut().unwrap();
        let n = fh.read_at(pos, &mut buf)?;
        if n < buf.len() {
            err_at!(IoRead, msg: "record {} short read {}/{}", self.recno, n, buf.len())?;
        }
        Ok(buf)
    }

    fn set_empty_state(&mut self) {
        self.recno = 0;
        self.bof = true;
        self.eof = true;
    }

    // freshly opened, unpositioned: before-first when records exist,
    // the empty state otherwise.
    fn set_boundary_state(&mut self) {
        if self.header.n_records == 0 {
            self.set_empty_state();
        } else {
            self.recno = 0;
            self.bof = true;
            self.eof = false;
        }
    }

    fn mark_indexes_stale(&mut self) {
        for cdx in self.indexes.iter_mut() {
            cdx.mark_stale();
        }
    }

    fn index_location(&self, path: Option<&str>) -> ffi::OsString {
        match path {
            Some(path) => with_default_extension(path, &self.config.index_extension),
            None => sibling_path(&self.location, &self.config.index_extension),
        }
    }
}

// Per-record evaluation context used while rebuilding tags.
struct RecordView<'a> {
    fields: &'a [FieldInfo],
    record: &'a [u8],
    recno: u32,
    count: u32,
}

impl<'a> RecordView<'a> {
    fn cell(&self, info: &FieldInfo) -> &[u8] {
        &self.record[info.offset..info.offset + info.length as usize]
    }
}

impl<'a> EvalContext for RecordView<'a> {
    fn field_value(&self, name: &str) -> Option<ExprValue> {
        let info = self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))?;
        let cell = self.cell(info);
        let value = match info.typ {
            FieldType::Numeric
            | FieldType::Float
            | FieldType::Integer
            | FieldType::Currency => ExprValue::Num(field::decode_float(cell)),
            FieldType::Logical => ExprValue::Bool(field::decode_bool(cell)),
            FieldType::Date => ExprValue::Date(field::decode_date(cell)),
            _ => ExprValue::Str(field::decode_str(cell)),
        };
        Some(value)
    }

    fn recno(&self) -> u32 {
        self.recno
    }

    fn reccount(&self) -> u32 {
        self.count
    }

    fn deleted(&self) -> bool {
        self.record.first() == Some(&TOMBSTONE_DELETED)
    }
}

fn no_such_field(field: Field) -> Error {
    let prefix = format!("{}:{}", file!(), line!());
    Error::Fatal(prefix, format!("no such field slot {}", field.0))
}

fn blank_record(hdr: &header::Header, fields: &[FieldInfo]) -> Vec<u8> {
    let mut blank = vec![b' '; hdr.record_len as usize];
    blank[0] = TOMBSTONE_LIVE;
    for info in fields.iter() {
        if info.typ == FieldType::Logical {
            blank[info.offset] = b'F';
        }
    }
    blank
}

fn with_default_extension(path: &str, ext: &str) -> ffi::OsString {
    let p = path::Path::new(path);
    match p.extension() {
        Some(_) => p.as_os_str().to_os_string(),
        None => p.with_extension(ext).into_os_string(),
    }
}

fn sibling_path(location: &ffi::OsStr, ext: &str) -> ffi::OsString {
    path::Path::new(location).with_extension(ext).into_os_string()
}

fn alias_of(location: &ffi::OsStr) -> String {
    path::Path::new(location)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_uppercase())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "cursor_test.rs"]
mod cursor_test;
