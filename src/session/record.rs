//! Persisted session records and the stores that hold them.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::primitives::io::{remove_if_exists, replace_file};
use crate::session::bat::{BlockSet, Delta};
use crate::types::checksum::{append_seal, split_seal};
use crate::types::{tagged_crc32, BlockId, BlockRange, LineageError, Result, SessionId};

const RECORD_MAGIC: [u8; 4] = *b"LNSR";
const RECORD_VERSION: u8 = 1;

const FLAG_PERMANENT: u8 = 0b0001;
const FLAG_DESTROYED: u8 = 0b0010;
const FLAG_HAS_TITLE: u8 = 0b0100;

/// One node of the session chain as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session number.
    pub number: SessionId,
    /// Session this one was created from.
    pub parent: Option<SessionId>,
    /// Session this one is attached to; differs from `parent` once ancestors
    /// have been fused away.
    pub up_link: Option<SessionId>,
    /// Creation time, unix seconds.
    pub created: u64,
    /// `user@host:pid` of the creator.
    pub creator: String,
    /// Optional human title.
    pub title: Option<String>,
    /// Never retired.
    pub permanent: bool,
    /// Fused into a later session.
    pub destroyed: bool,
    /// Session that absorbed this one.
    pub destroyed_by: Option<SessionId>,
    /// Most recent ancestor fused into this session.
    pub absorbed: Option<SessionId>,
    /// Blocks allocated relative to `up_link`.
    pub bat_plus: BlockSet,
    /// Blocks freed relative to `up_link`.
    pub bat_minus: BlockSet,
}

impl SessionRecord {
    /// A fresh, live record attached to `parent`.
    pub fn new(number: SessionId, parent: Option<SessionId>, created: u64, creator: String) -> Self {
        Self {
            number,
            parent,
            up_link: parent,
            created,
            creator,
            title: None,
            permanent: false,
            destroyed: false,
            destroyed_by: None,
            absorbed: None,
            bat_plus: BlockSet::new(),
            bat_minus: BlockSet::new(),
        }
    }

    /// The record's allocation delta.
    pub fn delta(&self) -> Delta {
        Delta {
            plus: self.bat_plus.clone(),
            minus: self.bat_minus.clone(),
        }
    }

    /// Returns `true` unless the session was fused away.
    pub fn is_live(&self) -> bool {
        !self.destroyed
    }

    /// Serializes the record; the trailing CRC covers everything before it.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(&RECORD_MAGIC);
        out.push(RECORD_VERSION);
        let mut flags = 0u8;
        if self.permanent {
            flags |= FLAG_PERMANENT;
        }
        if self.destroyed {
            flags |= FLAG_DESTROYED;
        }
        if self.title.is_some() {
            flags |= FLAG_HAS_TITLE;
        }
        out.push(flags);
        out.extend_from_slice(&self.number.0.to_be_bytes());
        for link in [self.parent, self.up_link, self.destroyed_by, self.absorbed] {
            out.extend_from_slice(&link.map_or(0, |s| s.0).to_be_bytes());
        }
        out.extend_from_slice(&self.created.to_be_bytes());
        put_str(&mut out, &self.creator)?;
        put_str(&mut out, self.title.as_deref().unwrap_or(""))?;
        put_ranges(&mut out, &self.bat_plus.to_ranges())?;
        put_ranges(&mut out, &self.bat_minus.to_ranges())?;
        append_seal(self.number.0, &mut out);
        Ok(out)
    }

    /// Parses and verifies a record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (body, stored_crc) = split_seal(bytes)?;
        let mut r = Reader { buf: body };
        if r.take(4)? != RECORD_MAGIC {
            return Err(LineageError::Corruption("session record magic mismatch"));
        }
        if r.u8()? != RECORD_VERSION {
            return Err(LineageError::Corruption("session record version unknown"));
        }
        let flags = r.u8()?;
        let number = SessionId(r.u64()?);
        if tagged_crc32(number.0, body) != stored_crc {
            return Err(LineageError::Corruption("session record crc mismatch"));
        }
        let link = |v: u64| (v != 0).then_some(SessionId(v));
        let parent = link(r.u64()?);
        let up_link = link(r.u64()?);
        let destroyed_by = link(r.u64()?);
        let absorbed = link(r.u64()?);
        let created = r.u64()?;
        let creator = r.string()?;
        let title = r.string()?;
        let bat_plus = BlockSet::from_ranges(&r.ranges()?);
        let bat_minus = BlockSet::from_ranges(&r.ranges()?);
        if !r.buf.is_empty() {
            return Err(LineageError::Corruption("session record has trailing bytes"));
        }
        Ok(Self {
            number,
            parent,
            up_link,
            created,
            creator,
            title: (flags & FLAG_HAS_TITLE != 0).then_some(title),
            permanent: flags & FLAG_PERMANENT != 0,
            destroyed: flags & FLAG_DESTROYED != 0,
            destroyed_by,
            absorbed,
            bat_plus,
            bat_minus,
        })
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| LineageError::Invalid("string too long"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_ranges(out: &mut Vec<u8>, ranges: &[BlockRange]) -> Result<()> {
    let count =
        u32::try_from(ranges.len()).map_err(|_| LineageError::Invalid("too many block ranges"))?;
    out.extend_from_slice(&count.to_be_bytes());
    for range in ranges {
        out.extend_from_slice(&range.start.0.to_be_bytes());
        out.extend_from_slice(&range.len.to_be_bytes());
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(LineageError::Corruption("session record truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| LineageError::Corruption("session record string is not utf-8"))
    }

    fn ranges(&mut self) -> Result<Vec<BlockRange>> {
        let count = self.u32()? as usize;
        if count > self.buf.len() / 12 {
            return Err(LineageError::Corruption("session record range count invalid"));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let start = self.u64()?;
            let len = self.u32()?;
            out.push(BlockRange::new(BlockId(start), len));
        }
        Ok(out)
    }
}

/// Durable home of the session records.
pub trait SessionStore: Send {
    /// Every stored record, in ascending session order.
    fn load_all(&self) -> Result<Vec<SessionRecord>>;
    /// Inserts or replaces a record; must be atomic per record.
    fn put(&self, record: &SessionRecord) -> Result<()>;
    /// Deletes a record; missing records are not an error.
    fn remove(&self, number: SessionId) -> Result<()>;
}

/// [`SessionStore`] keeping one file per session, `s<number>.rec`.
pub struct DirSessionStore {
    dir: PathBuf,
    sync: bool,
}

impl DirSessionStore {
    /// Opens (creating if needed) the record directory.
    pub fn open(dir: impl Into<PathBuf>, sync: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, sync })
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, number: SessionId) -> PathBuf {
        self.dir.join(format!("s{}.rec", number.0))
    }
}

fn parse_record_name(name: &str) -> Option<u64> {
    name.strip_prefix('s')?.strip_suffix(".rec")?.parse().ok()
}

impl SessionStore for DirSessionStore {
    fn load_all(&self) -> Result<Vec<SessionRecord>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(number) = parse_record_name(&name) else {
                trace!(name = %name, "session_store.skip");
                continue;
            };
            let bytes = match fs::read(entry.path()) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let record = SessionRecord::decode(&bytes)?;
            if record.number.0 != number {
                return Err(LineageError::Corruption("session record stored under wrong name"));
            }
            out.push(record);
        }
        out.sort_by_key(|r| r.number);
        Ok(out)
    }

    fn put(&self, record: &SessionRecord) -> Result<()> {
        let bytes = record.encode()?;
        replace_file(&self.path_of(record.number), &bytes, self.sync)?;
        debug!(session = record.number.0, bytes = bytes.len(), "session_store.put");
        Ok(())
    }

    fn remove(&self, number: SessionId) -> Result<()> {
        remove_if_exists(&self.path_of(number))?;
        Ok(())
    }
}

/// In-memory [`SessionStore`]; clones share the same records. Records are
/// kept encoded so the codec is exercised.
#[derive(Clone, Default)]
pub struct MemSessionStore {
    records: Arc<Mutex<BTreeMap<u64, Vec<u8>>>>,
}

impl MemSessionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns `true` when no record is stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl SessionStore for MemSessionStore {
    fn load_all(&self) -> Result<Vec<SessionRecord>> {
        self.records
            .lock()
            .values()
            .map(|bytes| SessionRecord::decode(bytes))
            .collect()
    }

    fn put(&self, record: &SessionRecord) -> Result<()> {
        let bytes = record.encode()?;
        self.records.lock().insert(record.number.0, bytes);
        Ok(())
    }

    fn remove(&self, number: SessionId) -> Result<()> {
        self.records.lock().remove(&number.0);
        Ok(())
    }
}
