//! Persisted, monotonically increasing transaction ids.
use parking_lot::Mutex;

use crate::storage::{BlockAccessor, BlockStore, PersistenceLevel, StorageError};

const BLOCK_NAME: &str = "TransactionIdProvider";
const LAST_ID: &str = "last_id";

/// Hands out strictly increasing transaction ids, starting at 1.
pub struct TransactionIdProvider {
    block: BlockAccessor,
    last: Mutex<u64>,
}

impl TransactionIdProvider {
    pub fn new(store: &BlockStore) -> Result<Self, StorageError> {
        let (block, _) = store.get_or_create_block(PersistenceLevel::Critical, BLOCK_NAME, 1)?;
        let last = block.get_or_default::<u64>(0, LAST_ID)?;
        Ok(TransactionIdProvider {
            block,
            last: Mutex::new(last),
        })
    }

    /// Reserves the next id. The write joins any scope open on this thread; ids reserved in
    /// a discarded scope are skipped, never reused.
    pub fn next_id(&self) -> Result<u64, StorageError> {
        let mut last = self.last.lock();
        let next = *last + 1;
        let mut tx = self.block.start_transaction();
        tx.set(0, LAST_ID, &next)?;
        tx.commit()?;
        *last = next;
        Ok(next)
    }

    pub fn last_id(&self) -> u64 {
        *self.last.lock()
    }
}
