//! The block store: named, typed blocks of fields with per-thread scoped transactions.
use std::{
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, ThreadId},
};

use parking_lot::{Mutex, RwLock};

use crate::storage::{
    Block, BlockAccessor, PersistenceLevel, ScopedTransaction, StorageError, block::PendingWrite,
    snapshot,
};

/// Work deferred until the writes it describes are committed.
pub(crate) type CommitAction = Box<dyn FnOnce() + Send>;

/// Writes buffered by the scope open on one thread.
#[derive(Default)]
struct ScopeBuffer {
    depth: usize,
    aborted: bool,
    writes: Vec<PendingWrite>,
    after_commit: Vec<CommitAction>,
}

pub(crate) struct StoreInner {
    blocks: RwLock<BTreeMap<String, Block>>,
    scopes: Mutex<HashMap<ThreadId, ScopeBuffer>>,
    path: Option<PathBuf>,
    fail_next_commit: AtomicBool,
}

/// The persistent block store shared by every ledger component.
#[derive(Clone)]
pub struct BlockStore {
    inner: Arc<StoreInner>,
}

impl BlockStore {
    /// Creates a store that lives in memory only.
    pub fn in_memory() -> Self {
        Self::with_blocks(BTreeMap::new(), None)
    }

    /// Opens a file-backed store, loading the snapshot at `path` if one exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let blocks = if path.exists() {
            let blocks = snapshot::read(&path)?;
            tracing::info!(path = %path.display(), blocks = blocks.len(), "block store loaded");
            blocks
        } else {
            tracing::info!(path = %path.display(), "block store created");
            BTreeMap::new()
        };
        Ok(Self::with_blocks(blocks, Some(path)))
    }

    fn with_blocks(blocks: BTreeMap<String, Block>, path: Option<PathBuf>) -> Self {
        BlockStore {
            inner: Arc::new(StoreInner {
                blocks: RwLock::new(blocks),
                scopes: Mutex::new(HashMap::new()),
                path,
                fail_next_commit: AtomicBool::new(false),
            }),
        }
    }

    /// Whether a block with this name exists.
    pub fn block_exists(&self, name: &str) -> bool {
        self.inner.blocks.read().contains_key(name)
    }

    /// Creates a new block with every field unset.
    pub fn create_block(
        &self,
        level: PersistenceLevel,
        name: &str,
        element_count: usize,
    ) -> Result<BlockAccessor, StorageError> {
        {
            let mut blocks = self.inner.blocks.write();
            if blocks.contains_key(name) {
                return Err(StorageError::BlockExists(name.to_string()));
            }
            blocks.insert(name.to_string(), Block::new(level, element_count));
            if level.is_durable() {
                if let Err(err) = self.inner.flush(&blocks) {
                    blocks.remove(name);
                    return Err(err);
                }
            }
        }
        tracing::debug!(block = name, element_count, ?level, "block created");
        Ok(self.accessor(name.to_string(), level, element_count))
    }

    /// Opens an existing block.
    pub fn get_block(&self, name: &str) -> Result<BlockAccessor, StorageError> {
        let blocks = self.inner.blocks.read();
        let block = blocks
            .get(name)
            .ok_or_else(|| StorageError::UnknownBlock(name.to_string()))?;
        Ok(self.accessor(name.to_string(), block.level, block.elements.len()))
    }

    /// Opens the block if it exists, otherwise creates it.
    ///
    /// Returns the accessor and whether the block was created by this call. An existing block
    /// with a different element count is a layout mismatch.
    pub fn get_or_create_block(
        &self,
        level: PersistenceLevel,
        name: &str,
        element_count: usize,
    ) -> Result<(BlockAccessor, bool), StorageError> {
        if self.block_exists(name) {
            let accessor = self.get_block(name)?;
            if accessor.element_count() != element_count {
                return Err(StorageError::LayoutMismatch {
                    block: name.to_string(),
                    expected: element_count,
                    actual: accessor.element_count(),
                });
            }
            Ok((accessor, false))
        } else {
            Ok((self.create_block(level, name, element_count)?, true))
        }
    }

    /// Opens a store-wide scoped transaction on the current thread.
    pub fn scoped_transaction(&self) -> ScopedTransaction {
        let mut scopes = self.inner.scopes.lock();
        scopes.entry(thread::current().id()).or_default().depth += 1;
        ScopedTransaction {
            store: Arc::clone(&self.inner),
            completed: false,
            _thread_bound: PhantomData,
        }
    }

    /// Whether the current thread has a scoped transaction open.
    pub fn in_scope(&self) -> bool {
        self.inner
            .scopes
            .lock()
            .contains_key(&thread::current().id())
    }

    /// Runs `action` after the current scope on this thread completes, or now if none is open.
    pub fn after_commit<F: FnOnce() + Send + 'static>(&self, action: F) {
        self.inner.after_commit(Box::new(action));
    }

    /// Makes the next top-level publish fail as if the device lost power mid-write.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn accessor(&self, name: String, level: PersistenceLevel, element_count: usize) -> BlockAccessor {
        BlockAccessor {
            store: Arc::clone(&self.inner),
            name,
            level,
            element_count,
        }
    }
}

impl StoreInner {
    pub(crate) fn read_field(
        &self,
        block: &str,
        index: usize,
        field: &str,
    ) -> Result<Option<serde_json::Value>, StorageError> {
        let blocks = self.blocks.read();
        let block_ref = blocks
            .get(block)
            .ok_or_else(|| StorageError::UnknownBlock(block.to_string()))?;
        let element = block_ref
            .elements
            .get(index)
            .ok_or_else(|| StorageError::IndexOutOfRange {
                block: block.to_string(),
                index,
                count: block_ref.elements.len(),
            })?;
        Ok(element.get(field).cloned())
    }

    pub(crate) fn commit_or_buffer(&self, writes: Vec<PendingWrite>) -> Result<(), StorageError> {
        {
            let mut scopes = self.scopes.lock();
            if let Some(scope) = scopes.get_mut(&thread::current().id()) {
                scope.writes.extend(writes);
                return Ok(());
            }
        }
        self.publish(writes)
    }

    pub(crate) fn complete_scope(&self) -> Result<(), StorageError> {
        let finished = {
            let mut scopes = self.scopes.lock();
            let id = thread::current().id();
            let Some(scope) = scopes.get_mut(&id) else {
                return Ok(());
            };
            scope.depth -= 1;
            if scope.depth > 0 {
                return Ok(());
            }
            scopes.remove(&id)
        };
        match finished {
            Some(scope) if scope.aborted => {
                tracing::warn!(writes = scope.writes.len(), "scoped transaction discarded");
                Err(StorageError::ScopeAborted)
            }
            Some(scope) => {
                self.publish(scope.writes)?;
                for action in scope.after_commit {
                    action();
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Runs `action` once everything committed so far on this thread is durable: right away
    /// outside a scope, on outermost completion inside one. Discarded with an aborted scope.
    pub(crate) fn after_commit(&self, action: CommitAction) {
        {
            let mut scopes = self.scopes.lock();
            if let Some(scope) = scopes.get_mut(&thread::current().id()) {
                scope.after_commit.push(action);
                return;
            }
        }
        action();
    }

    pub(crate) fn abort_scope(&self) {
        let mut scopes = self.scopes.lock();
        let id = thread::current().id();
        let Some(scope) = scopes.get_mut(&id) else {
            return;
        };
        scope.depth -= 1;
        if scope.depth == 0 {
            if let Some(scope) = scopes.remove(&id) {
                tracing::debug!(writes = scope.writes.len(), "scoped transaction rolled back");
            }
        } else {
            scope.aborted = true;
        }
    }

    /// Applies a batch of writes atomically: either every write lands (in memory and on disk)
    /// or none does.
    pub(crate) fn publish(&self, writes: Vec<PendingWrite>) -> Result<(), StorageError> {
        if writes.is_empty() {
            return Ok(());
        }
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other(
                "simulated power loss before commit",
            )));
        }

        let mut blocks = self.blocks.write();
        for write in &writes {
            let block = blocks
                .get(&write.block)
                .ok_or_else(|| StorageError::UnknownBlock(write.block.clone()))?;
            if write.index >= block.elements.len() {
                return Err(StorageError::IndexOutOfRange {
                    block: write.block.clone(),
                    index: write.index,
                    count: block.elements.len(),
                });
            }
        }

        let mut undo = Vec::with_capacity(writes.len());
        let mut durable = false;
        for write in writes {
            if let Some(block) = blocks.get_mut(&write.block) {
                durable |= block.level.is_durable();
                let previous = block.elements[write.index].insert(write.field.clone(), write.value);
                undo.push((write.block, write.index, write.field, previous));
            }
        }

        if durable {
            if let Err(err) = self.flush(&blocks) {
                for (name, index, field, previous) in undo.into_iter().rev() {
                    if let Some(block) = blocks.get_mut(&name) {
                        match previous {
                            Some(value) => block.elements[index].insert(field, value),
                            None => block.elements[index].remove(&field),
                        };
                    }
                }
                tracing::error!(error = %err, "block store commit failed, writes reverted");
                return Err(err);
            }
        }
        Ok(())
    }

    fn flush(&self, blocks: &BTreeMap<String, Block>) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let durable: BTreeMap<&str, &Block> = blocks
            .iter()
            .filter(|(_, block)| block.level.is_durable())
            .map(|(name, block)| (name.as_str(), block))
            .collect();
        snapshot::write(path, &durable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get_block() {
        let store = BlockStore::in_memory();
        assert!(!store.block_exists("Bank"));
        store
            .create_block(PersistenceLevel::Critical, "Bank", 3)
            .unwrap();
        assert!(store.block_exists("Bank"));
        let block = store.get_block("Bank").unwrap();
        assert_eq!(block.element_count(), 3);
        assert!(matches!(
            store.create_block(PersistenceLevel::Critical, "Bank", 3),
            Err(StorageError::BlockExists(_))
        ));
        assert!(matches!(
            store.get_block("Missing"),
            Err(StorageError::UnknownBlock(_))
        ));
    }

    #[test]
    fn test_layout_mismatch() {
        let store = BlockStore::in_memory();
        store
            .create_block(PersistenceLevel::Critical, "Bank", 3)
            .unwrap();
        assert!(matches!(
            store.get_or_create_block(PersistenceLevel::Critical, "Bank", 4),
            Err(StorageError::LayoutMismatch { .. })
        ));
        let (_, created) = store
            .get_or_create_block(PersistenceLevel::Critical, "Bank", 3)
            .unwrap();
        assert!(!created);
    }

    #[test]
    fn test_commit_and_rollback() {
        let store = BlockStore::in_memory();
        let block = store
            .create_block(PersistenceLevel::Critical, "Meters", 2)
            .unwrap();

        let mut tx = block.start_transaction();
        tx.set(0, "lifetime", &10u64).unwrap();
        tx.commit().unwrap();
        assert_eq!(block.get::<u64>(0, "lifetime").unwrap(), Some(10));

        let mut tx = block.start_transaction();
        tx.set(0, "lifetime", &20u64).unwrap();
        drop(tx);
        assert_eq!(block.get::<u64>(0, "lifetime").unwrap(), Some(10));
        assert_eq!(block.get::<u64>(1, "lifetime").unwrap(), None);
    }

    #[test]
    fn test_set_out_of_range() {
        let store = BlockStore::in_memory();
        let block = store
            .create_block(PersistenceLevel::Critical, "Meters", 1)
            .unwrap();
        let mut tx = block.start_transaction();
        assert!(matches!(
            tx.set(1, "lifetime", &1u64),
            Err(StorageError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_scope_buffers_until_complete() {
        let store = BlockStore::in_memory();
        let a = store.create_block(PersistenceLevel::Critical, "A", 1).unwrap();
        let b = store.create_block(PersistenceLevel::Critical, "B", 1).unwrap();

        let scope = store.scoped_transaction();
        let mut tx = a.start_transaction();
        tx.set(0, "v", &1u64).unwrap();
        tx.commit().unwrap();
        let mut tx = b.start_transaction();
        tx.set(0, "v", &2u64).unwrap();
        tx.commit().unwrap();
        assert_eq!(a.get::<u64>(0, "v").unwrap(), None);

        scope.complete().unwrap();
        assert_eq!(a.get::<u64>(0, "v").unwrap(), Some(1));
        assert_eq!(b.get::<u64>(0, "v").unwrap(), Some(2));
        assert!(!store.in_scope());
    }

    #[test]
    fn test_dropped_scope_discards_writes() {
        let store = BlockStore::in_memory();
        let a = store.create_block(PersistenceLevel::Critical, "A", 1).unwrap();
        {
            let _scope = store.scoped_transaction();
            let mut tx = a.start_transaction();
            tx.set(0, "v", &1u64).unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(a.get::<u64>(0, "v").unwrap(), None);
        assert!(!store.in_scope());
    }

    #[test]
    fn test_nested_scope_abort_poisons_outer() {
        let store = BlockStore::in_memory();
        let a = store.create_block(PersistenceLevel::Critical, "A", 1).unwrap();
        let outer = store.scoped_transaction();
        {
            let _inner = store.scoped_transaction();
            let mut tx = a.start_transaction();
            tx.set(0, "v", &1u64).unwrap();
            tx.commit().unwrap();
        }
        assert!(matches!(outer.complete(), Err(StorageError::ScopeAborted)));
        assert_eq!(a.get::<u64>(0, "v").unwrap(), None);
    }

    #[test]
    fn test_nested_scope_publishes_with_outer() {
        let store = BlockStore::in_memory();
        let a = store.create_block(PersistenceLevel::Critical, "A", 1).unwrap();
        let outer = store.scoped_transaction();
        let inner = store.scoped_transaction();
        let mut tx = a.start_transaction();
        tx.set(0, "v", &7u64).unwrap();
        tx.commit().unwrap();
        inner.complete().unwrap();
        assert_eq!(a.get::<u64>(0, "v").unwrap(), None);
        outer.complete().unwrap();
        assert_eq!(a.get::<u64>(0, "v").unwrap(), Some(7));
    }

    #[test]
    fn test_after_commit_waits_for_scope() {
        let store = BlockStore::in_memory();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        store.after_commit(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.swap(false, Ordering::SeqCst));

        let scope = store.scoped_transaction();
        let flag = Arc::clone(&ran);
        store.after_commit(move || flag.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
        scope.complete().unwrap();
        assert!(ran.swap(false, Ordering::SeqCst));

        {
            let _scope = store.scoped_transaction();
            let flag = Arc::clone(&ran);
            store.after_commit(move || flag.store(true, Ordering::SeqCst));
        }
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_simulated_failure_leaves_no_effect() {
        let store = BlockStore::in_memory();
        let a = store.create_block(PersistenceLevel::Critical, "A", 1).unwrap();
        store.fail_next_commit();
        let mut tx = a.start_transaction();
        tx.set(0, "v", &1u64).unwrap();
        assert!(matches!(tx.commit(), Err(StorageError::Io(_))));
        assert_eq!(a.get::<u64>(0, "v").unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvram.bin");
        {
            let store = BlockStore::open(&path).unwrap();
            let a = store.create_block(PersistenceLevel::Critical, "A", 1).unwrap();
            let t = store
                .create_block(PersistenceLevel::Transient, "T", 1)
                .unwrap();
            let mut tx = a.start_transaction();
            tx.set(0, "v", &99u64).unwrap();
            tx.commit().unwrap();
            let mut tx = t.start_transaction();
            tx.set(0, "v", &1u64).unwrap();
            tx.commit().unwrap();
        }
        let store = BlockStore::open(&path).unwrap();
        assert!(store.block_exists("A"));
        assert!(!store.block_exists("T"));
        let a = store.get_block("A").unwrap();
        assert_eq!(a.get::<u64>(0, "v").unwrap(), Some(99));
    }
}
