//! Blocks, accessors and the two transaction scopes the store offers.
use std::{collections::BTreeMap, marker::PhantomData, sync::Arc};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::storage::{StorageError, store::StoreInner};

/// The fields of one block element, keyed by field name.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// How durable a block is.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceLevel {
    /// Configuration-grade data, survives restarts.
    Static,
    /// Financial data, survives restarts.
    Critical,
    /// Kept for the lifetime of the process only.
    Transient,
}

impl PersistenceLevel {
    /// Whether blocks of this level are written to the snapshot file.
    pub fn is_durable(self) -> bool {
        !matches!(self, PersistenceLevel::Transient)
    }
}

/// A named block: a fixed number of elements, each holding a set of fields.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Block {
    pub(crate) level: PersistenceLevel,
    pub(crate) elements: Vec<Fields>,
}

impl Block {
    pub(crate) fn new(level: PersistenceLevel, element_count: usize) -> Self {
        Block {
            level,
            elements: vec![Fields::new(); element_count],
        }
    }
}

/// A single field write waiting for its transaction to commit.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub(crate) block: String,
    pub(crate) index: usize,
    pub(crate) field: String,
    pub(crate) value: serde_json::Value,
}

/// Read access to a block and the entry point for writing to it.
#[derive(Clone)]
pub struct BlockAccessor {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) name: String,
    pub(crate) level: PersistenceLevel,
    pub(crate) element_count: usize,
}

impl BlockAccessor {
    /// The block name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The block persistence level.
    pub fn level(&self) -> PersistenceLevel {
        self.level
    }

    /// Number of elements in the block.
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Reads a committed field. Returns `None` when the field was never written.
    pub fn get<T: DeserializeOwned>(
        &self,
        index: usize,
        field: &str,
    ) -> Result<Option<T>, StorageError> {
        let Some(value) = self.store.read_field(&self.name, index, field)? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StorageError::Decode {
                block: self.name.clone(),
                field: field.to_string(),
                source,
            })
    }

    /// Reads a committed field, falling back to `T::default()` when unset.
    pub fn get_or_default<T: DeserializeOwned + Default>(
        &self,
        index: usize,
        field: &str,
    ) -> Result<T, StorageError> {
        Ok(self.get(index, field)?.unwrap_or_default())
    }

    /// Runs `action` once the writes committed on this thread are durable.
    /// See [`BlockStore::after_commit`](crate::storage::BlockStore::after_commit).
    pub fn after_commit<F: FnOnce() + Send + 'static>(&self, action: F) {
        self.store.after_commit(Box::new(action));
    }

    /// Starts a transaction against this block.
    pub fn start_transaction(&self) -> BlockTransaction {
        BlockTransaction {
            store: Arc::clone(&self.store),
            block: self.name.clone(),
            element_count: self.element_count,
            writes: Vec::new(),
            committed: false,
        }
    }
}

/// A set of field writes against one block, applied together on [`BlockTransaction::commit`].
///
/// Dropping the transaction without committing discards every write.
pub struct BlockTransaction {
    store: Arc<StoreInner>,
    block: String,
    element_count: usize,
    writes: Vec<PendingWrite>,
    committed: bool,
}

impl BlockTransaction {
    /// Stages a field write.
    pub fn set<T: Serialize + ?Sized>(
        &mut self,
        index: usize,
        field: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        if index >= self.element_count {
            return Err(StorageError::IndexOutOfRange {
                block: self.block.clone(),
                index,
                count: self.element_count,
            });
        }
        let value = serde_json::to_value(value).map_err(|source| StorageError::Encode {
            block: self.block.clone(),
            field: field.to_string(),
            source,
        })?;
        self.writes.push(PendingWrite {
            block: self.block.clone(),
            index,
            field: field.to_string(),
            value,
        });
        Ok(())
    }

    /// Commits the staged writes.
    ///
    /// Inside an open [`ScopedTransaction`] on this thread the writes join the scope and
    /// become visible only when the outermost scope completes.
    pub fn commit(mut self) -> Result<(), StorageError> {
        self.committed = true;
        let writes = std::mem::take(&mut self.writes);
        self.store.commit_or_buffer(writes)
    }

    /// Commits the staged writes straight to the store, ignoring any open scope.
    pub fn commit_immediate(mut self) -> Result<(), StorageError> {
        self.committed = true;
        let writes = std::mem::take(&mut self.writes);
        self.store.publish(writes)
    }
}

impl Drop for BlockTransaction {
    fn drop(&mut self) {
        if !self.committed && !self.writes.is_empty() {
            tracing::debug!(block = %self.block, "block transaction rolled back");
        }
    }
}

/// A store-wide transaction spanning every block commit made on the current thread.
///
/// Scopes nest; only the outermost [`ScopedTransaction::complete`] publishes. Dropping any
/// scope without completing it discards everything buffered by the outermost scope.
pub struct ScopedTransaction {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) completed: bool,
    // Scopes are bound to the thread that opened them.
    pub(crate) _thread_bound: PhantomData<*const ()>,
}

impl ScopedTransaction {
    /// Completes the scope, publishing buffered writes if this is the outermost scope.
    pub fn complete(mut self) -> Result<(), StorageError> {
        self.completed = true;
        self.store.complete_scope()
    }
}

impl Drop for ScopedTransaction {
    fn drop(&mut self) {
        if !self.completed {
            self.store.abort_scope();
        }
    }
}
