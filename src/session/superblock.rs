//! Superblock: the single control record naming the committed session.
//!
//! Two copies live in blocks 0 and 1. A commit of session `n` overwrites slot
//! `n % 2`, so a torn write only ever damages the copy that was about to
//! become current and `load` falls back to the other one. The successful
//! slot write is the commit point.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::primitives::blocks::BlockStore;
use crate::types::{tagged_crc32, BlockId, LineageError, Result, SessionId};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;
/// Longest database name accepted, in bytes.
pub const MAX_NAME_LEN: usize = 32;

const MAGIC: [u8; 4] = *b"LNGS";
const BYTE_ORDER_TAG: u32 = 0x0102_0304;

const SB_MAGIC: Range<usize> = 0..4;
const SB_BYTE_ORDER: Range<usize> = 4..8;
const SB_SCHEMA: Range<usize> = 8..12;
const SB_BLOCK_SIZE: Range<usize> = 12..16;
const SB_SESSION: Range<usize> = 16..24;
const SB_GLOBAL_TABLE: Range<usize> = 24..32;
const SB_NAME_LEN: Range<usize> = 32..34;
const SB_RESERVED: Range<usize> = 34..40;
const SB_NAME: Range<usize> = 40..40 + MAX_NAME_LEN;
const SB_CRC: Range<usize> = 72..76;
const SB_LEN: usize = 76;

/// Byte order of an encoded superblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// Order of the running machine.
    pub const NATIVE: ByteOrder = if cfg!(target_endian = "big") {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    };

    fn put_u16(self, dst: &mut [u8], v: u16) {
        match self {
            ByteOrder::Little => dst.copy_from_slice(&v.to_le_bytes()),
            ByteOrder::Big => dst.copy_from_slice(&v.to_be_bytes()),
        }
    }

    fn put_u32(self, dst: &mut [u8], v: u32) {
        match self {
            ByteOrder::Little => dst.copy_from_slice(&v.to_le_bytes()),
            ByteOrder::Big => dst.copy_from_slice(&v.to_be_bytes()),
        }
    }

    fn put_u64(self, dst: &mut [u8], v: u64) {
        match self {
            ByteOrder::Little => dst.copy_from_slice(&v.to_le_bytes()),
            ByteOrder::Big => dst.copy_from_slice(&v.to_be_bytes()),
        }
    }

    fn get_u16(self, src: &[u8]) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(src);
        match self {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        }
    }

    fn get_u32(self, src: &[u8]) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(src);
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }

    fn get_u64(self, src: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(src);
        match self {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        }
    }
}

/// Decoded superblock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Most recently committed session; the database clock.
    pub session: SessionId,
    /// Root of the object layer; opaque to the session engine.
    pub global_table: BlockId,
    /// Schema version of the writer.
    pub schema_version: u32,
    /// Block size of the block store.
    pub block_size: u32,
    /// Human readable database name.
    pub name: String,
    /// Byte order the block was found in; commits always write native order.
    pub byte_order: ByteOrder,
}

impl Superblock {
    /// Superblock of a freshly formatted database.
    pub fn new(name: &str, block_size: u32) -> Result<Self> {
        if name.len() > MAX_NAME_LEN {
            return Err(LineageError::Invalid("database name longer than 32 bytes"));
        }
        Ok(Self {
            session: SessionId::FIRST,
            global_table: BlockId(0),
            schema_version: SCHEMA_VERSION,
            block_size,
            name: name.to_string(),
            byte_order: ByteOrder::NATIVE,
        })
    }

    /// Slot block this superblock is written to.
    pub fn slot(&self) -> BlockId {
        BlockId(self.session.0 % 2)
    }

    /// Encodes into `buf` (one whole block) using `order`.
    pub fn encode(&self, buf: &mut [u8], order: ByteOrder) -> Result<()> {
        if buf.len() < SB_LEN {
            return Err(LineageError::Invalid("superblock buffer too small"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(LineageError::Invalid("database name longer than 32 bytes"));
        }
        buf.fill(0);
        buf[SB_MAGIC].copy_from_slice(&MAGIC);
        order.put_u32(&mut buf[SB_BYTE_ORDER], BYTE_ORDER_TAG);
        order.put_u32(&mut buf[SB_SCHEMA], self.schema_version);
        order.put_u32(&mut buf[SB_BLOCK_SIZE], self.block_size);
        order.put_u64(&mut buf[SB_SESSION], self.session.0);
        order.put_u64(&mut buf[SB_GLOBAL_TABLE], self.global_table.0);
        order.put_u16(&mut buf[SB_NAME_LEN], self.name.len() as u16);
        buf[SB_NAME][..self.name.len()].copy_from_slice(self.name.as_bytes());
        let crc = tagged_crc32(self.slot().0, buf);
        order.put_u32(&mut buf[SB_CRC], crc);
        Ok(())
    }

    /// Decodes one slot; `slot` is the block it was read from.
    pub fn decode(buf: &[u8], slot: BlockId) -> Result<Self> {
        if buf.len() < SB_LEN {
            return Err(LineageError::Corruption("superblock truncated"));
        }
        if buf[SB_MAGIC] != MAGIC {
            return Err(LineageError::Corruption("superblock magic mismatch"));
        }
        let byte_order = match ByteOrder::Little.get_u32(&buf[SB_BYTE_ORDER]) {
            BYTE_ORDER_TAG => ByteOrder::Little,
            tag if tag == BYTE_ORDER_TAG.swap_bytes() => ByteOrder::Big,
            _ => return Err(LineageError::Corruption("superblock byte order tag invalid")),
        };
        let stored_crc = byte_order.get_u32(&buf[SB_CRC]);
        let mut scratch = buf.to_vec();
        scratch[SB_CRC].fill(0);
        if tagged_crc32(slot.0, &scratch) != stored_crc {
            return Err(LineageError::Corruption("superblock crc mismatch"));
        }
        if buf[SB_RESERVED].iter().any(|b| *b != 0) {
            return Err(LineageError::Corruption("superblock reserved field non-zero"));
        }
        let session = SessionId(byte_order.get_u64(&buf[SB_SESSION]));
        if session.0 % 2 != slot.0 {
            return Err(LineageError::Corruption("superblock found in the wrong slot"));
        }
        let name_len = byte_order.get_u16(&buf[SB_NAME_LEN]) as usize;
        if name_len > MAX_NAME_LEN {
            return Err(LineageError::Corruption("superblock name length invalid"));
        }
        let name = std::str::from_utf8(&buf[SB_NAME][..name_len])
            .map_err(|_| LineageError::Corruption("superblock name is not utf-8"))?
            .to_string();
        Ok(Self {
            session,
            global_table: BlockId(byte_order.get_u64(&buf[SB_GLOBAL_TABLE])),
            schema_version: byte_order.get_u32(&buf[SB_SCHEMA]),
            block_size: byte_order.get_u32(&buf[SB_BLOCK_SIZE]),
            name,
            byte_order,
        })
    }
}

/// Result of [`SuperblockStore::revalidate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// The on-disk session is the one the caller expected.
    Current,
    /// Someone committed after the caller read the superblock.
    Stale {
        /// Session now on disk.
        on_disk: SessionId,
    },
}

/// Reads and writes the superblock slots of a block store.
pub struct SuperblockStore {
    blocks: Arc<dyn BlockStore>,
    allow_schema_mismatch: bool,
    sync: bool,
}

impl SuperblockStore {
    /// Wraps `blocks`; `sync` makes every commit flush the store.
    pub fn new(blocks: Arc<dyn BlockStore>, sync: bool, allow_schema_mismatch: bool) -> Self {
        Self {
            blocks,
            allow_schema_mismatch,
            sync,
        }
    }

    /// Formats a fresh database: writes session 1 and clears the other slot.
    pub fn create(&self, name: &str) -> Result<Superblock> {
        let block_size = self.blocks.block_size();
        let sb = Superblock::new(name, block_size as u32)?;
        let other = BlockId((sb.slot().0 + 1) % 2);
        self.blocks.write_block(other, &vec![0u8; block_size])?;
        self.commit(&sb)?;
        Ok(sb)
    }

    /// Reads both slots and returns the newest valid one.
    pub fn load(&self) -> Result<Superblock> {
        let mut best: Option<Superblock> = None;
        let mut buf = vec![0u8; self.blocks.block_size()];
        for slot in [BlockId(0), BlockId(1)] {
            self.blocks.read_block(slot, &mut buf)?;
            if buf.iter().all(|b| *b == 0) {
                continue;
            }
            match Superblock::decode(&buf, slot) {
                Ok(sb) => {
                    if best.as_ref().map_or(true, |b| sb.session > b.session) {
                        best = Some(sb);
                    }
                }
                Err(err) => warn!(slot = slot.0, error = %err, "superblock.slot.invalid"),
            }
        }
        let sb = best.ok_or(LineageError::Corruption("no valid superblock"))?;
        if sb.byte_order != ByteOrder::NATIVE {
            debug!(session = sb.session.0, "superblock.load.byte_swapped");
        }
        if sb.block_size as usize != self.blocks.block_size() {
            return Err(LineageError::Corruption("superblock block size mismatch"));
        }
        if sb.schema_version != SCHEMA_VERSION {
            if !self.allow_schema_mismatch {
                error!(
                    found = sb.schema_version,
                    expected = SCHEMA_VERSION,
                    "superblock.schema_mismatch"
                );
                return Err(LineageError::SchemaMismatch {
                    found: sb.schema_version,
                    expected: SCHEMA_VERSION,
                });
            }
            warn!(found = sb.schema_version, "superblock.schema_mismatch.allowed");
        }
        Ok(sb)
    }

    /// Writes `sb` to its slot in native byte order; the last step of a
    /// commit.
    pub fn commit(&self, sb: &Superblock) -> Result<()> {
        let mut buf = vec![0u8; self.blocks.block_size()];
        let mut native = sb.clone();
        native.byte_order = ByteOrder::NATIVE;
        native.schema_version = SCHEMA_VERSION;
        native.encode(&mut buf, ByteOrder::NATIVE)?;
        self.blocks.write_block(native.slot(), &buf)?;
        if self.sync {
            self.blocks.flush_caches()?;
        }
        debug!(session = sb.session.0, slot = native.slot().0, "superblock.commit");
        Ok(())
    }

    /// Re-reads the slots and compares with the session the caller last saw.
    pub fn revalidate(&self, expected: SessionId) -> Result<Freshness> {
        let on_disk = self.load()?.session;
        if on_disk == expected {
            Ok(Freshness::Current)
        } else {
            Ok(Freshness::Stale { on_disk })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::blocks::MemBlockStore;

    fn store(mem: &MemBlockStore) -> SuperblockStore {
        SuperblockStore::new(Arc::new(mem.clone()), true, false)
    }

    #[test]
    fn create_then_load() {
        let mem = MemBlockStore::new(512);
        let sbs = store(&mem);
        let created = sbs.create("genomes").unwrap();
        let loaded = sbs.load().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.session, SessionId(1));
        assert_eq!(loaded.name, "genomes");
        assert!(mem.flushes() >= 1);
    }

    #[test]
    fn newest_valid_slot_wins_and_torn_write_falls_back() {
        let mem = MemBlockStore::new(512);
        let sbs = store(&mem);
        let mut sb = sbs.create("db").unwrap();
        sb.session = SessionId(2);
        sb.global_table = BlockId(40);
        sbs.commit(&sb).unwrap();
        assert_eq!(sbs.load().unwrap().global_table, BlockId(40));

        sb.session = SessionId(3);
        sbs.commit(&sb).unwrap();
        let mut torn = vec![0u8; 512];
        mem.read_block(BlockId(1), &mut torn).unwrap();
        torn[SB_GLOBAL_TABLE.start] ^= 0xff;
        mem.write_block(BlockId(1), &torn).unwrap();
        assert_eq!(sbs.load().unwrap().session, SessionId(2));
    }

    #[test]
    fn foreign_byte_order_is_swapped() {
        let mem = MemBlockStore::new(512);
        let sbs = store(&mem);
        let mut sb = Superblock::new("swapped", 512).unwrap();
        sb.session = SessionId(7);
        sb.global_table = BlockId(0x0102_0304_0506);
        let foreign = match ByteOrder::NATIVE {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        };
        let mut buf = vec![0u8; 512];
        sb.encode(&mut buf, foreign).unwrap();
        mem.write_block(sb.slot(), &buf).unwrap();
        let loaded = sbs.load().unwrap();
        assert_eq!(loaded.byte_order, foreign);
        assert_eq!(loaded.session, SessionId(7));
        assert_eq!(loaded.global_table, sb.global_table);
    }

    #[test]
    fn schema_mismatch_is_fatal_unless_allowed() {
        let mem = MemBlockStore::new(512);
        let mut sb = Superblock::new("old", 512).unwrap();
        sb.schema_version = SCHEMA_VERSION + 1;
        let mut buf = vec![0u8; 512];
        sb.encode(&mut buf, ByteOrder::NATIVE).unwrap();
        mem.write_block(sb.slot(), &buf).unwrap();
        let err = store(&mem).load().unwrap_err();
        assert!(matches!(err, LineageError::SchemaMismatch { .. }));
        assert!(err.is_fatal());
        let lenient = SuperblockStore::new(Arc::new(mem.clone()), true, true);
        assert_eq!(lenient.load().unwrap().schema_version, SCHEMA_VERSION + 1);
    }

    #[test]
    fn bad_magic_and_empty_store_are_corruption() {
        let mem = MemBlockStore::new(512);
        assert!(matches!(
            store(&mem).load().unwrap_err(),
            LineageError::Corruption(_)
        ));
        mem.write_block(BlockId(1), &[0xAB; 512]).unwrap();
        assert!(store(&mem).load().unwrap_err().is_fatal());
    }

    #[test]
    fn revalidate_reports_staleness() {
        let mem = MemBlockStore::new(512);
        let reader = store(&mem);
        let writer = store(&mem);
        let mut sb = writer.create("db").unwrap();
        assert_eq!(reader.revalidate(SessionId(1)).unwrap(), Freshness::Current);
        sb.session = SessionId(2);
        writer.commit(&sb).unwrap();
        assert_eq!(
            reader.revalidate(SessionId(1)).unwrap(),
            Freshness::Stale {
                on_disk: SessionId(2)
            }
        );
    }

    #[test]
    fn long_names_are_rejected() {
        assert!(Superblock::new(&"x".repeat(33), 512).is_err());
        assert!(Superblock::new(&"x".repeat(32), 512).is_ok());
    }
}
