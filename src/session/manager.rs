//! The database handle.
//!
//! A [`SessionManager`] is what a process holds while it uses a database:
//! it reads the superblock, keeps a readlock on the session it reads, and,
//! once [`SessionManager::begin_write`] succeeded, owns the write lock and
//! the bookkeeping of the session being built. Everything that touches the
//! filesystem goes through the backends passed to the builder so tests can
//! swap them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::blocks::{BlockStore, FileBlockStore};
use crate::session::autosave::{Autosave, AutosaveAction, AutosaveTimer};
use crate::session::bat::BlockSet;
use crate::session::chain::{plan_repair, SessionChain};
use crate::session::config::SessionConfig;
use crate::session::exit::{ExitHooks, HostHook, RecoveryHook, Resources};
use crate::session::identity::{unix_now, Identity};
use crate::session::lock::{FileLockManager, LockManager, LockMode};
use crate::session::log::{CommitLog, ExitKind};
use crate::session::readlock::{DirReadlockRegistry, ReadlockRegistry, ReadlockScan};
use crate::session::record::{DirSessionStore, SessionRecord, SessionStore};
use crate::session::superblock::{Freshness, Superblock, SuperblockStore};
use crate::types::{BlockId, BlockRange, LineageError, LockHolder, Result, SessionId};

/// Block store file inside a database directory.
pub const BLOCKS_FILE: &str = "blocks.db";
/// Session record directory.
pub const SESSIONS_DIR: &str = "sessions";
/// Write lock file.
pub const LOCK_FILE: &str = "lock";
/// Readlock marker directory.
pub const READLOCK_DIR: &str = "readlocks";
/// Commit log file.
pub const LOG_FILE: &str = "commit.log";

/// Outcome of a successful commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    /// Session that was committed.
    pub session: u64,
    /// Session it was built on.
    pub parent: u64,
    /// Sessions fused away by the retirement pass, oldest first.
    pub retired: Vec<u64>,
    /// Blocks returned to the free pool by the retirement pass.
    pub released_blocks: usize,
    /// Sessions protected by readlocks during retirement.
    pub protected: Vec<u64>,
    /// Set when the retirement pass stopped early. The commit itself stands;
    /// the next writer start finishes any half-done fusion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retire_error: Option<String>,
}

struct WriteSession {
    number: SessionId,
    parent: SessionId,
    plus: BlockSet,
    minus: BlockSet,
    /// Blocks visible from `parent`.
    visible: BlockSet,
    title: Option<String>,
    permanent: bool,
    global_table: BlockId,
}

impl WriteSession {
    fn new(parent: SessionId, visible: BlockSet, global_table: BlockId) -> Self {
        Self {
            number: parent.next(),
            parent,
            plus: BlockSet::new(),
            minus: BlockSet::new(),
            visible,
            title: None,
            permanent: false,
            global_table,
        }
    }
}

/// Assembles a [`SessionManager`]; every backend defaults to the file-based
/// one inside the database directory.
pub struct SessionManagerBuilder {
    dir: PathBuf,
    config: Option<SessionConfig>,
    identity: Option<Identity>,
    blocks: Option<Arc<dyn BlockStore>>,
    sessions: Option<Box<dyn SessionStore>>,
    lock: Option<Box<dyn LockManager>>,
    readlocks: Option<Box<dyn ReadlockRegistry>>,
    hooks: ExitHooks,
}

impl SessionManagerBuilder {
    /// Uses `config` instead of `<dir>/lineage.toml`.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the process identity.
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Replaces the block store.
    pub fn block_store(mut self, blocks: Arc<dyn BlockStore>) -> Self {
        self.blocks = Some(blocks);
        self
    }

    /// Replaces the session record store.
    pub fn session_store(mut self, sessions: Box<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Replaces the write lock.
    pub fn lock_manager(mut self, lock: Box<dyn LockManager>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Replaces the readlock registry.
    pub fn readlock_registry(mut self, readlocks: Box<dyn ReadlockRegistry>) -> Self {
        self.readlocks = Some(readlocks);
        self
    }

    /// Replaces the crash recovery hook.
    pub fn recovery_hook(mut self, hook: Box<dyn RecoveryHook>) -> Self {
        self.hooks.set_recovery(hook);
        self
    }

    /// Installs a hook notified when the process ends.
    pub fn host_hook(mut self, hook: Box<dyn HostHook>) -> Self {
        self.hooks.set_host(hook);
        self
    }

    /// Formats a new database named `name` and opens it.
    pub fn create(self, name: &str) -> Result<SessionManager> {
        std::fs::create_dir_all(&self.dir)?;
        let config = match self.config.clone() {
            Some(config) => config.validated()?,
            None => SessionConfig::load_from_dir(&self.dir)?,
        };
        let dir = self.dir.clone();
        let mut manager = self.assemble(config)?;
        manager.format(name)?;
        manager.config.persist_to_dir(&dir)?;
        manager.start_reading()?;
        Ok(manager)
    }

    /// Opens an existing database.
    pub fn open(self) -> Result<SessionManager> {
        let config = match self.config.clone() {
            Some(config) => config.validated()?,
            None => SessionConfig::load_from_dir(&self.dir)?,
        };
        let mut manager = self.assemble(config)?;
        manager.superblock = manager.superblocks.load()?;
        manager.start_reading()?;
        Ok(manager)
    }

    fn assemble(self, config: SessionConfig) -> Result<SessionManager> {
        let dir = self.dir;
        let identity = self.identity.unwrap_or_else(Identity::current);
        let blocks: Arc<dyn BlockStore> = match self.blocks {
            Some(blocks) => blocks,
            None => Arc::new(FileBlockStore::open(dir.join(BLOCKS_FILE), config.block_size)?),
        };
        let sessions: Box<dyn SessionStore> = match self.sessions {
            Some(sessions) => sessions,
            None => Box::new(DirSessionStore::open(dir.join(SESSIONS_DIR), config.sync_write)?),
        };
        let lock: Box<dyn LockManager> = match self.lock {
            Some(lock) => lock,
            None => {
                let mode = if config.suppress_kernel_lock {
                    LockMode::Existence
                } else {
                    LockMode::Kernel
                };
                Box::new(FileLockManager::new(dir.join(LOCK_FILE), mode).with_wait(config.lock_wait()))
            }
        };
        let readlocks: Box<dyn ReadlockRegistry> = match self.readlocks {
            Some(readlocks) => readlocks,
            None => Box::new(DirReadlockRegistry::new(
                dir.join(READLOCK_DIR),
                identity.clone(),
                config.readlock_timeout(),
            )),
        };
        let superblocks = SuperblockStore::new(
            Arc::clone(&blocks),
            config.sync_write,
            config.allow_schema_mismatch,
        );
        let log = CommitLog::open(dir.join(LOG_FILE), &identity);
        let now = Instant::now();
        Ok(SessionManager {
            dir,
            identity,
            blocks,
            superblocks,
            sessions,
            lock,
            readlocks,
            log,
            hooks: self.hooks,
            superblock: Superblock::new("", config.block_size as u32)?,
            write: None,
            autosave: Autosave::new(now),
            timer: None,
            last_readlock_check: now,
            crashed: false,
            config,
        })
    }
}

/// Handle on one database for the lifetime of a process.
pub struct SessionManager {
    dir: PathBuf,
    config: SessionConfig,
    identity: Identity,
    blocks: Arc<dyn BlockStore>,
    superblocks: SuperblockStore,
    sessions: Box<dyn SessionStore>,
    lock: Box<dyn LockManager>,
    readlocks: Box<dyn ReadlockRegistry>,
    log: CommitLog,
    hooks: ExitHooks,
    superblock: Superblock,
    write: Option<WriteSession>,
    autosave: Autosave,
    timer: Option<AutosaveTimer>,
    last_readlock_check: Instant,
    crashed: bool,
}

impl SessionManager {
    /// Starts building a manager for the database in `dir`.
    pub fn builder(dir: impl Into<PathBuf>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            dir: dir.into(),
            config: None,
            identity: None,
            blocks: None,
            sessions: None,
            lock: None,
            readlocks: None,
            hooks: ExitHooks::new(),
        }
    }

    /// Formats a database in `dir` with default backends.
    pub fn create(dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        Self::builder(dir).create(name)
    }

    /// Opens the database in `dir` with default backends.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(dir).open()
    }

    fn format(&mut self, name: &str) -> Result<()> {
        match self.superblocks.load() {
            Err(LineageError::Corruption("no valid superblock")) => {}
            Ok(_) | Err(LineageError::SchemaMismatch { .. }) => {
                return Err(LineageError::Invalid("database already exists"));
            }
            Err(err) => return Err(err),
        }
        self.lock.acquire(SessionId::FIRST, &self.identity)?;
        let result = (|| {
            let mut root = SessionRecord::new(
                SessionId::FIRST,
                None,
                unix_now(),
                self.identity.to_string(),
            );
            root.permanent = true;
            root.title = Some("created".to_string());
            self.sessions.put(&root)?;
            self.superblocks.create(name)
        })();
        let release = self.lock.release();
        self.superblock = result?;
        release?;
        self.log.record(&format!("database {name:?} created"));
        info!(dir = %self.dir.display(), name, "session.create");
        Ok(())
    }

    fn start_reading(&mut self) -> Result<()> {
        let session = self.superblock.session;
        if !self.readlocks.register(session) {
            self.log.record("readlock unavailable, running unprotected");
        }
        self.log.record(&format!("opened at session {session}"));
        info!(session = session.0, "session.open");
        if let Some((save, idle)) = self.config.autosave() {
            self.configure_autosave(save, idle)?;
        }
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.crashed {
            return Err(LineageError::Invalid("session manager crashed"));
        }
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut WriteSession> {
        self.write.as_mut().ok_or(LineageError::NotWriter)
    }

    /// Database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Effective configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Identity written into locks, markers and records.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Superblock as last read or written by this handle.
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Session this handle reads from.
    pub fn committed_session(&self) -> SessionId {
        self.superblock.session
    }

    /// Session being written, if the write lock is held.
    pub fn current_session(&self) -> Option<SessionId> {
        self.write.as_ref().map(|w| w.number)
    }

    /// Returns `true` while this handle may write.
    pub fn is_writer(&self) -> bool {
        self.write.is_some()
    }

    /// Checks whether someone committed since this handle read the
    /// superblock.
    pub fn revalidate(&self) -> Result<Freshness> {
        self.superblocks.revalidate(self.superblock.session)
    }

    /// Moves a reader to the newest committed session.
    pub fn refresh(&mut self) -> Result<SessionId> {
        self.ensure_alive()?;
        if self.write.is_some() {
            return Err(LineageError::Invalid("cannot refresh while writing"));
        }
        self.superblock = self.superblocks.load()?;
        let session = self.superblock.session;
        self.readlocks.renew(session);
        debug!(session = session.0, "session.refresh");
        Ok(session)
    }

    /// Takes the write lock and starts building the next session.
    ///
    /// Fails with [`LineageError::LockHeld`] on contention and with
    /// [`LineageError::StaleSuperblock`] when another process committed since
    /// this handle read the superblock.
    pub fn begin_write(&mut self) -> Result<SessionId> {
        self.ensure_alive()?;
        if self.write.is_some() {
            return Err(LineageError::Invalid("write session already open"));
        }
        let next = self.superblock.session.next();
        self.lock.acquire(next, &self.identity)?;
        match self.prepare_write() {
            Ok(write) => {
                self.log.record(&format!("lock acquired for session {next}"));
                self.write = Some(write);
                Ok(next)
            }
            Err(err) => {
                if let Err(release_err) = self.lock.release() {
                    warn!(error = %release_err, "session.begin_write.release_failed");
                }
                if err.is_fatal() {
                    self.crash(&err.to_string());
                }
                Err(err)
            }
        }
    }

    fn prepare_write(&mut self) -> Result<WriteSession> {
        if let Freshness::Stale { on_disk } = self.revalidate()? {
            return Err(LineageError::StaleSuperblock {
                expected: self.superblock.session,
                on_disk,
            });
        }
        let committed = self.superblock.session;
        let records = self.repaired_records(committed)?;
        let chain = SessionChain::build(records);
        if chain.generation(committed).is_none() {
            return Err(LineageError::Corruption("committed session record missing"));
        }
        self.blocks.restore_allocation(&chain.in_use_ranges())?;
        Ok(WriteSession::new(
            committed,
            chain.visible_blocks(committed),
            self.superblock.global_table,
        ))
    }

    /// Loads every record, first discarding records newer than `committed`
    /// and finishing fusions whose tombstone never reached disk.
    fn repaired_records(&mut self, committed: SessionId) -> Result<Vec<SessionRecord>> {
        let mut records = self.sessions.load_all()?;
        let repair = plan_repair(&records, committed);
        if !repair.is_empty() {
            warn!(
                discarded = repair.discard.len(),
                tombstones = repair.tombstones.len(),
                "session.repair"
            );
            for number in &repair.discard {
                self.sessions.remove(*number)?;
                self.log.record(&format!("discarded uncommitted session {number}"));
            }
            for tombstone in &repair.tombstones {
                self.sessions.put(tombstone)?;
                self.log.record(&format!(
                    "completed interrupted retirement of session {}",
                    tombstone.number
                ));
            }
            records = self.sessions.load_all()?;
        }
        Ok(records)
    }

    /// Allocates `n` contiguous blocks for the session being written.
    pub fn allocate(&mut self, n: u32) -> Result<BlockRange> {
        self.writer()?;
        let range = self.blocks.allocate(n)?;
        if let Some(write) = self.write.as_mut() {
            write.plus.insert_range(range);
        }
        self.note_modification();
        Ok(range)
    }

    /// Frees blocks. Blocks allocated by the current session go straight
    /// back to the pool; older blocks stay reserved until retirement.
    pub fn free(&mut self, range: BlockRange) -> Result<()> {
        range.checked_end()?;
        let blocks = Arc::clone(&self.blocks);
        let write = self.writer()?;
        let mut immediate = BlockSet::new();
        for block in range.iter() {
            let visible = write.visible.contains(block) && !write.minus.contains(block);
            if !write.plus.contains(block) && !visible {
                return Err(LineageError::Invalid("freed block is not allocated"));
            }
        }
        for block in range.iter() {
            if write.plus.remove(block) {
                immediate.insert(block);
            } else {
                write.minus.insert(block);
            }
        }
        for run in immediate.to_ranges() {
            blocks.free(run)?;
        }
        self.note_modification();
        Ok(())
    }

    /// Reads one block.
    pub fn read_block(&self, id: BlockId, dst: &mut [u8]) -> Result<()> {
        self.blocks.read_block(id, dst)
    }

    /// Writes a block allocated by the current session; committed blocks are
    /// immutable.
    pub fn write_block(&mut self, id: BlockId, src: &[u8]) -> Result<()> {
        let write = self.writer()?;
        if !write.plus.contains(id) {
            return Err(LineageError::Invalid("block belongs to a committed session"));
        }
        self.blocks.write_block(id, src)?;
        self.note_modification();
        Ok(())
    }

    /// Sets the object-layer root recorded by the next commit.
    pub fn set_global_table(&mut self, root: BlockId) -> Result<()> {
        self.writer()?.global_table = root;
        self.note_modification();
        Ok(())
    }

    /// Titles the session being written.
    pub fn set_title(&mut self, title: impl Into<String>) -> Result<()> {
        self.writer()?.title = Some(title.into());
        self.note_modification();
        Ok(())
    }

    /// Exempts the session being written from retirement.
    pub fn mark_permanent(&mut self) -> Result<()> {
        self.writer()?.permanent = true;
        self.note_modification();
        Ok(())
    }

    /// Commits the session being written and starts the next one.
    ///
    /// Fatal failures run the crash sequence before they are returned.
    pub fn commit(&mut self) -> Result<CommitReport> {
        self.ensure_alive()?;
        if self.write.is_none() {
            return Err(LineageError::NotWriter);
        }
        if !self.lock.is_held() {
            let err = LineageError::LockNotHeld;
            self.crash(&err.to_string());
            return Err(err);
        }
        self.autosave.begin_save();
        let result = self.commit_inner();
        let action = self.autosave.end_save(Instant::now(), result.is_ok());
        self.apply_timer(action);
        match &result {
            Ok(report) => info!(
                session = report.session,
                retired = report.retired.len(),
                released = report.released_blocks,
                "session.commit.done"
            ),
            Err(err) if err.is_fatal() => self.crash(&err.to_string()),
            Err(err) => warn!(error = %err, "session.commit.failed"),
        }
        result
    }

    fn commit_inner(&mut self) -> Result<CommitReport> {
        if let Freshness::Stale { on_disk } = self.revalidate()? {
            return Err(LineageError::StaleSuperblock {
                expected: self.superblock.session,
                on_disk,
            });
        }
        let write = self.write.as_ref().ok_or(LineageError::NotWriter)?;
        let number = write.number;
        let parent = write.parent;
        let mut record = SessionRecord::new(
            number,
            Some(parent),
            unix_now(),
            self.identity.to_string(),
        );
        record.title = write.title.clone();
        record.permanent = write.permanent;
        record.bat_plus = write.plus.clone();
        record.bat_minus = write.minus.clone();
        let visible = write.visible.difference(&write.minus).union(&write.plus);
        let global_table = write.global_table;

        self.sessions.put(&record)?;
        if self.config.sync_write {
            self.blocks.flush_caches()?;
        }
        let mut next = self.superblock.clone();
        next.session = number;
        next.global_table = global_table;
        self.superblocks.commit(&next)?;
        self.superblock = next;
        self.write = Some(WriteSession::new(number, visible, global_table));

        self.readlocks.renew(number);
        self.log.record(&format!("session {number} committed"));

        // The superblock write above is the commit point; from here on only
        // fatal failures may fail the call.
        let mut report = CommitReport {
            session: number.0,
            parent: parent.0,
            retired: Vec::new(),
            released_blocks: 0,
            protected: Vec::new(),
            retire_error: None,
        };
        match self.retire(number, &mut report) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(session = number.0, error = %err, "retire.failed");
                self.log.record(&format!("retirement after session {number} stopped: {err}"));
                report.retire_error = Some(err.to_string());
            }
        }
        Ok(report)
    }

    /// Retirement pass for `tip`; runs only right after a commit. Progress is
    /// recorded in `report` step by step so a failure keeps what was done.
    fn retire(&mut self, tip: SessionId, report: &mut CommitReport) -> Result<()> {
        let scan = match self.readlocks.scan(SystemTime::now()) {
            Ok(scan) => scan,
            Err(err) => {
                warn!(error = %err, "retire.skipped.readlock_scan_failed");
                return Ok(());
            }
        };
        // Our own marker names the tip, which keep_alive already shields;
        // counting it would pin every ancestor.
        let protected: BTreeSet<SessionId> = scan
            .active
            .iter()
            .filter(|e| !(e.pid == self.identity.pid && e.host == self.identity.host))
            .map(|e| SessionId(e.session))
            .collect();
        report.protected = protected.iter().map(|s| s.0).collect();
        let mut chain = SessionChain::build(self.repaired_records(tip)?);
        let plan = chain.plan_retirement(tip, self.config.keep_alive, &protected)?;
        for step in &plan {
            self.sessions.put(&step.child)?;
            self.sessions.put(&step.parent)?;
            for run in step.released.to_ranges() {
                self.blocks.free(run)?;
            }
            report.released_blocks += step.released.len();
            report.retired.push(step.parent.number.0);
            debug!(
                parent = step.parent.number.0,
                child = step.child.number.0,
                "retire.fuse"
            );
            self.log.record(&format!(
                "session {} fused into {}",
                step.parent.number, step.child.number
            ));
        }
        Ok(())
    }

    /// Drops uncommitted work and releases the write lock.
    pub fn end_write(&mut self) -> Result<()> {
        let write = self.write.take().ok_or(LineageError::NotWriter)?;
        for run in write.plus.to_ranges() {
            self.blocks.free(run)?;
        }
        match self.lock.release() {
            Ok(()) => {
                self.log.record("lock released");
                Ok(())
            }
            Err(err) => {
                if err.is_fatal() {
                    self.crash(&err.to_string());
                }
                Err(err)
            }
        }
    }

    /// Current holder of the write lock.
    pub fn lock_holder(&self) -> Result<Option<LockHolder>> {
        self.lock.holder()
    }

    /// Scans the readlock registry.
    pub fn readers(&mut self) -> Result<ReadlockScan> {
        self.readlocks.scan(SystemTime::now())
    }

    /// Rebuilds the session chain from the record store.
    pub fn chain(&self) -> Result<SessionChain> {
        Ok(SessionChain::build(self.sessions.load_all()?))
    }

    /// Re-creates this process's readlock marker if it is due for a check.
    pub fn readlock_self_check(&mut self) -> bool {
        if self.last_readlock_check.elapsed() < self.config.readlock_check_interval() {
            return true;
        }
        self.last_readlock_check = Instant::now();
        self.readlocks.self_check()
    }

    /// The user is interacting with the data.
    pub fn touch_activity(&mut self) {
        let action = self.autosave.activity(Instant::now());
        self.apply_timer(action);
    }

    /// The data was modified. Every mutating call on the write session
    /// signals this itself; hosts call it for changes made elsewhere.
    pub fn note_modification(&mut self) {
        let action = self.autosave.modification(Instant::now());
        self.apply_timer(action);
    }

    /// Configures autosave; a zero `save_interval` turns it off.
    pub fn configure_autosave(&mut self, save_interval: Duration, idle_interval: Duration) -> Result<()> {
        let action = self
            .autosave
            .configure(save_interval, idle_interval, Instant::now());
        if save_interval.is_zero() {
            self.timer = None;
        } else if self.timer.is_none() {
            self.timer = Some(AutosaveTimer::spawn()?);
        }
        self.apply_timer(action);
        Ok(())
    }

    fn apply_timer(&self, action: AutosaveAction) {
        if let Some(timer) = &self.timer {
            timer.apply(action);
        }
    }

    /// Feeds one timer expiry at `now`; commits when the scheduler asks
    /// for it. Autosave never takes the lock: without a write session the
    /// request is dropped.
    pub fn autosave_tick(&mut self, now: Instant) -> Result<Option<CommitReport>> {
        let action = self.autosave.tick(now);
        self.apply_timer(action);
        if !action.commit {
            return Ok(None);
        }
        if self.write.is_none() {
            let action = self.autosave.end_save(now, true);
            self.apply_timer(action);
            return Ok(None);
        }
        debug!("autosave.commit.start");
        self.commit().map(Some)
    }

    /// Handles ticks delivered by the timer thread and runs the periodic
    /// readlock self-check.
    pub fn poll_autosave(&mut self) -> Result<Option<CommitReport>> {
        self.readlock_self_check();
        let mut report = None;
        while let Some(at) = self.timer.as_ref().and_then(AutosaveTimer::try_tick) {
            if let Some(done) = self.autosave_tick(at)? {
                report = Some(done);
            }
        }
        Ok(report)
    }

    /// Runs the crash sequence: recovery hook, abnormal log close, host hook.
    /// Later calls do nothing.
    pub fn crash(&mut self, reason: &str) {
        self.crashed = true;
        self.write = None;
        self.timer = None;
        let mut resources = Resources {
            lock: self.lock.as_mut(),
            readlocks: self.readlocks.as_mut(),
            log: &mut self.log,
        };
        self.hooks.crash(&mut resources, reason);
    }

    /// Orderly shutdown; uncommitted work is discarded.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.hooks.outcome().is_some() {
            return Ok(());
        }
        self.timer = None;
        let mut first_err = None;
        if let Some(write) = self.write.take() {
            for run in write.plus.to_ranges() {
                if let Err(err) = self.blocks.free(run) {
                    first_err.get_or_insert(err);
                }
            }
        }
        let mut resources = Resources {
            lock: self.lock.as_mut(),
            readlocks: self.readlocks.as_mut(),
            log: &mut self.log,
        };
        self.hooks.normal_exit(&mut resources);
        first_err.map_or(Ok(()), Err)
    }

    /// How the exit sequence ended, once it ran.
    pub fn exit_outcome(&self) -> Option<ExitKind> {
        self.hooks.outcome()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "session.drop.shutdown_failed");
        }
    }
}
