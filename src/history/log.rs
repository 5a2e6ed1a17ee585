//! The bounded, persisted transaction history.
use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    events::{EventBus, LedgerEvent},
    history::{HistoryError, HistoryLogConfig, RecordKind, TransactionIdProvider, TransactionRecord},
    storage::{BlockAccessor, BlockStore, PersistenceLevel, StorageError},
};

const RECORD: &str = "record";

/// The ring of one record kind. Slot of a record = `log_sequence mod capacity`.
struct RingLog {
    config: HistoryLogConfig,
    block: Option<BlockAccessor>,
    slots: Vec<Option<TransactionRecord>>,
    next_sequence: u64,
}

impl RingLog {
    fn open(store: &BlockStore, config: HistoryLogConfig) -> Result<Self, HistoryError> {
        if config.capacity == 0 {
            return Err(HistoryError::InvalidCapacity(config.kind));
        }
        let block = if config.persistable {
            let (block, _) = store.get_or_create_block(
                PersistenceLevel::Critical,
                &format!("History.{}", config.kind.as_str()),
                config.capacity,
            )?;
            Some(block)
        } else {
            None
        };
        let mut log = RingLog {
            slots: vec![None; config.capacity],
            config,
            block,
            next_sequence: 1,
        };
        log.load()?;
        Ok(log)
    }

    /// Replaces the slots with what the block holds. Memory-only logs keep their slots and
    /// only take back sequences handed out to records that never landed.
    fn load(&mut self) -> Result<(), StorageError> {
        let Some(block) = &self.block else {
            self.next_sequence = self
                .records()
                .map(|record| record.log_sequence)
                .max()
                .unwrap_or(0)
                + 1;
            return Ok(());
        };
        let mut slots = vec![None; self.config.capacity];
        let mut last_sequence = 0;
        for (slot, entry) in slots.iter_mut().enumerate() {
            let Some(record) = block.get::<TransactionRecord>(slot, RECORD)? else {
                continue;
            };
            if record.kind() != self.config.kind || self.slot_of(record.log_sequence) != slot {
                return Err(StorageError::Corrupted(format!(
                    "{} log holds sequence {} in slot {slot}",
                    self.config.kind.as_str(),
                    record.log_sequence
                )));
            }
            last_sequence = last_sequence.max(record.log_sequence);
            *entry = Some(record);
        }
        self.slots = slots;
        self.next_sequence = last_sequence + 1;
        Ok(())
    }

    fn slot_of(&self, sequence: u64) -> usize {
        (sequence % self.config.capacity as u64) as usize
    }

    fn write(&mut self, slot: usize, record: TransactionRecord) -> Result<(), StorageError> {
        if let Some(block) = &self.block {
            let mut tx = block.start_transaction();
            tx.set(slot, RECORD, &record)?;
            tx.commit()?;
        }
        self.slots[slot] = Some(record);
        Ok(())
    }

    fn is_persistable(&self) -> bool {
        self.block.is_some()
    }

    fn records(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.slots.iter().flatten()
    }
}

/// Fixed-capacity logs of completed money movements, one per record kind.
pub struct TransactionHistory {
    logs: Arc<Mutex<BTreeMap<RecordKind, RingLog>>>,
    ids: TransactionIdProvider,
    store: BlockStore,
    bus: Arc<EventBus>,
}

impl TransactionHistory {
    /// Opens a log for every entry of `configs`. Kinds without a config cannot be saved.
    pub fn new(
        store: &BlockStore,
        bus: Arc<EventBus>,
        configs: &[HistoryLogConfig],
    ) -> Result<Self, HistoryError> {
        let mut logs = BTreeMap::new();
        for config in configs {
            let log = RingLog::open(store, config.clone())?;
            tracing::debug!(
                kind = config.kind.as_str(),
                capacity = config.capacity,
                persistable = config.persistable,
                records = log.records().count(),
                "history log opened"
            );
            logs.insert(config.kind, log);
        }
        Ok(TransactionHistory {
            logs: Arc::new(Mutex::new(logs)),
            ids: TransactionIdProvider::new(store)?,
            store: store.clone(),
            bus,
        })
    }

    /// The capacity of the log for `kind`, if one is configured.
    pub fn max_transactions(&self, kind: RecordKind) -> Option<usize> {
        self.logs.lock().get(&kind).map(|log| log.config.capacity)
    }

    /// Assigns the next sequence and transaction id to `record`, stores it over the oldest
    /// slot if the log is full, and publishes `TransactionSaved`.
    pub fn save_transaction(
        &self,
        mut record: TransactionRecord,
    ) -> Result<TransactionRecord, HistoryError> {
        if let Some(id) = record.transaction_id {
            return Err(HistoryError::AlreadySaved(id));
        }
        let kind = record.kind();
        let mut logs = self.logs.lock();
        let log = logs
            .get_mut(&kind)
            .ok_or(HistoryError::NotConfigured(kind))?;

        let id = self.ids.next_id()?;
        let sequence = log.next_sequence;
        record.transaction_id = Some(id);
        record.log_sequence = sequence;
        let slot = log.slot_of(sequence);
        if let Some(evicted) = &log.slots[slot] {
            tracing::debug!(
                kind = kind.as_str(),
                evicted = ?evicted.transaction_id,
                "oldest record overwritten"
            );
        }
        self.write(log, slot, record.clone())?;
        log.next_sequence += 1;

        tracing::info!(kind = kind.as_str(), transaction_id = id, sequence, "transaction saved");
        self.publish_after_commit(LedgerEvent::TransactionSaved {
            kind,
            transaction_id: id,
        });
        Ok(record)
    }

    /// Rewrites a saved record in place, keeping its sequence.
    pub fn update_transaction(&self, record: &TransactionRecord) -> Result<(), HistoryError> {
        let id = record.transaction_id.ok_or(HistoryError::NotSupported)?;
        let kind = record.kind();
        let mut logs = self.logs.lock();
        let log = logs
            .get_mut(&kind)
            .ok_or(HistoryError::NotConfigured(kind))?;
        let (slot, sequence) = log
            .slots
            .iter()
            .enumerate()
            .find_map(|(slot, entry)| match entry {
                Some(existing) if existing.transaction_id == Some(id) => {
                    Some((slot, existing.log_sequence))
                }
                _ => None,
            })
            .ok_or(HistoryError::NotFound(id))?;

        let mut updated = record.clone();
        updated.log_sequence = sequence;
        self.write(log, slot, updated)?;

        tracing::info!(kind = kind.as_str(), transaction_id = id, "transaction updated");
        self.publish_after_commit(LedgerEvent::TransactionUpdated {
            kind,
            transaction_id: id,
        });
        Ok(())
    }

    /// Every record of every kind, ordered by transaction id.
    pub fn recall_transactions(&self) -> Vec<TransactionRecord> {
        let logs = self.logs.lock();
        let mut records: Vec<TransactionRecord> = logs
            .values()
            .flat_map(RingLog::records)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.transaction_id);
        records
    }

    /// The records of one kind, oldest first.
    pub fn recall_by_kind(&self, kind: RecordKind) -> Vec<TransactionRecord> {
        let logs = self.logs.lock();
        let mut records: Vec<TransactionRecord> = logs
            .get(&kind)
            .map(|log| log.records().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|record| record.log_sequence);
        records
    }

    /// The saved record with `transaction_id`, of any kind.
    pub fn find(&self, transaction_id: u64) -> Option<TransactionRecord> {
        self.logs
            .lock()
            .values()
            .flat_map(RingLog::records)
            .find(|record| record.transaction_id == Some(transaction_id))
            .cloned()
    }

    /// Writes `record` into `slot`. Inside a storage scope a memory-only log takes the record
    /// only once the scope completes, so an aborted movement leaves nothing behind.
    fn write(
        &self,
        log: &mut RingLog,
        slot: usize,
        record: TransactionRecord,
    ) -> Result<(), StorageError> {
        if log.is_persistable() || !self.store.in_scope() {
            return log.write(slot, record);
        }
        let logs = Arc::clone(&self.logs);
        let kind = log.config.kind;
        self.store.after_commit(move || {
            if let Some(log) = logs.lock().get_mut(&kind) {
                log.slots[slot] = Some(record);
            }
        });
        Ok(())
    }

    fn publish_after_commit(&self, event: LedgerEvent) {
        let bus = Arc::clone(&self.bus);
        self.store.after_commit(move || bus.publish(event));
    }

    /// Restores every persisted log from the store.
    pub fn reload(&self) -> Result<(), HistoryError> {
        let mut logs = self.logs.lock();
        for log in logs.values_mut() {
            log.load()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{Amounts, RecordDetail};

    fn bill(amount: i64) -> TransactionRecord {
        TransactionRecord::new(
            7,
            Amounts::cashable(amount),
            RecordDetail::BillIn {
                denomination: amount,
            },
        )
    }

    fn history(store: &BlockStore, capacity: usize, persistable: bool) -> TransactionHistory {
        let config = HistoryLogConfig {
            kind: RecordKind::BillIn,
            capacity,
            persistable,
        };
        TransactionHistory::new(store, Arc::new(EventBus::new()), &[config]).unwrap()
    }

    #[test]
    fn test_save_assigns_sequence_and_id() {
        let store = BlockStore::in_memory();
        let bus = Arc::new(EventBus::new());
        let mut events = bus.receiver();
        let history = TransactionHistory::new(
            &store,
            Arc::clone(&bus),
            &[HistoryLogConfig::new(RecordKind::BillIn, 5)],
        )
        .unwrap();

        let first = history.save_transaction(bill(100)).unwrap();
        let second = history.save_transaction(bill(500)).unwrap();
        assert_eq!((first.log_sequence, first.transaction_id), (1, Some(1)));
        assert_eq!((second.log_sequence, second.transaction_id), (2, Some(2)));
        assert_eq!(
            events.try_recv().unwrap(),
            LedgerEvent::TransactionSaved {
                kind: RecordKind::BillIn,
                transaction_id: 1
            }
        );
    }

    #[test]
    fn test_ring_keeps_newest() {
        let store = BlockStore::in_memory();
        let history = history(&store, 3, true);
        for amount in 1..=5 {
            history.save_transaction(bill(amount * 100)).unwrap();
        }
        let records = history.recall_by_kind(RecordKind::BillIn);
        assert_eq!(records.len(), 3);
        assert_eq!(
            records
                .iter()
                .map(|record| record.amounts.cashable)
                .collect::<Vec<_>>(),
            vec![300, 400, 500]
        );
        assert!(history.find(1).is_none());
        assert!(history.find(2).is_none());
        assert_eq!(history.recall_transactions().len(), 3);
    }

    #[test]
    fn test_records_survive_reopen() {
        let store = BlockStore::in_memory();
        {
            let history = history(&store, 3, true);
            for amount in 1..=4 {
                history.save_transaction(bill(amount)).unwrap();
            }
        }
        let history = history(&store, 3, true);
        assert_eq!(history.recall_by_kind(RecordKind::BillIn).len(), 3);
        let next = history.save_transaction(bill(9)).unwrap();
        assert_eq!(next.log_sequence, 5);
        assert_eq!(next.transaction_id, Some(5));
        assert!(history.find(2).is_none());
    }

    #[test]
    fn test_memory_only_log() {
        let store = BlockStore::in_memory();
        history(&store, 3, false).save_transaction(bill(1)).unwrap();
        assert!(!store.block_exists("History.bill_in"));
        assert!(history(&store, 3, false).recall_transactions().is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let store = BlockStore::in_memory();
        let result = TransactionHistory::new(
            &store,
            Arc::new(EventBus::new()),
            &[HistoryLogConfig::new(RecordKind::BillIn, 0)],
        );
        assert!(matches!(
            result,
            Err(HistoryError::InvalidCapacity(RecordKind::BillIn))
        ));
        assert!(!store.block_exists("History.bill_in"));
    }

    #[test]
    fn test_memory_only_log_waits_for_scope() {
        let store = BlockStore::in_memory();
        let history = history(&store, 3, false);
        {
            let scope = store.scoped_transaction();
            history.save_transaction(bill(1)).unwrap();
            assert!(history.recall_transactions().is_empty());
            scope.complete().unwrap();
        }
        let records = history.recall_transactions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].log_sequence, 1);
    }

    #[test]
    fn test_memory_only_log_forgets_failed_scope() {
        let store = BlockStore::in_memory();
        let history = history(&store, 3, false);
        history.save_transaction(bill(1)).unwrap();
        {
            let scope = store.scoped_transaction();
            history.save_transaction(bill(2)).unwrap();
            store.fail_next_commit();
            assert!(matches!(scope.complete(), Err(StorageError::Io(_))));
        }
        history.reload().unwrap();

        let records = history.recall_by_kind(RecordKind::BillIn);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amounts.cashable, 1);
        assert!(history.find(2).is_none());
        let next = history.save_transaction(bill(3)).unwrap();
        assert_eq!(next.log_sequence, 2);
    }

    #[test]
    fn test_update_transaction() {
        let store = BlockStore::in_memory();
        let history = TransactionHistory::new(
            &store,
            Arc::new(EventBus::new()),
            &[HistoryLogConfig::new(RecordKind::VoucherOut, 4)],
        )
        .unwrap();
        let saved = history
            .save_transaction(TransactionRecord::new(
                2,
                Amounts::cashable(2500),
                RecordDetail::VoucherOut {
                    barcode: "9001".to_string(),
                    printed: false,
                },
            ))
            .unwrap();

        let mut printed = saved.clone();
        printed.detail = RecordDetail::VoucherOut {
            barcode: "9001".to_string(),
            printed: true,
        };
        printed.log_sequence = 99;
        history.update_transaction(&printed).unwrap();

        let stored = history.find(saved.transaction_id.unwrap()).unwrap();
        assert_eq!(stored.log_sequence, saved.log_sequence);
        assert!(matches!(stored.detail, RecordDetail::VoucherOut { printed: true, .. }));
    }

    #[test]
    fn test_update_unsaved_record_not_supported() {
        let store = BlockStore::in_memory();
        let history = history(&store, 3, true);
        assert!(matches!(
            history.update_transaction(&bill(1)),
            Err(HistoryError::NotSupported)
        ));

        let mut stray = bill(1);
        stray.transaction_id = Some(42);
        assert!(matches!(
            history.update_transaction(&stray),
            Err(HistoryError::NotFound(42))
        ));
    }

    #[test]
    fn test_unconfigured_kind_and_resave() {
        let store = BlockStore::in_memory();
        let history = history(&store, 3, true);
        let coin = TransactionRecord::new(
            1,
            Amounts::cashable(25),
            RecordDetail::CoinIn { denomination: 25 },
        );
        assert!(matches!(
            history.save_transaction(coin),
            Err(HistoryError::NotConfigured(RecordKind::CoinIn))
        ));
        let saved = history.save_transaction(bill(1)).unwrap();
        assert!(matches!(
            history.save_transaction(saved),
            Err(HistoryError::AlreadySaved(1))
        ));
    }

    #[test]
    fn test_reload_after_discarded_scope() {
        let store = BlockStore::in_memory();
        let history = history(&store, 3, true);
        history.save_transaction(bill(1)).unwrap();
        {
            let _scope = store.scoped_transaction();
            history.save_transaction(bill(2)).unwrap();
        }
        assert_eq!(history.recall_transactions().len(), 2);
        history.reload().unwrap();
        assert_eq!(history.recall_transactions().len(), 1);
        let next = history.save_transaction(bill(3)).unwrap();
        assert_eq!(next.log_sequence, 2);
        assert_eq!(next.transaction_id, Some(3));
    }
}
