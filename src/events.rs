//! Domain events and the bus they travel on.
use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    bank::{AccountType, Money},
    coordinator::{RequestorId, TransactionHandle, TransactionKind},
    funds::MovementKind,
    history::RecordKind,
};

/// The size of the broadcast buffer. Slow subscribers that fall further behind lose events.
const EVENT_CAPACITY: usize = 1024;

/// Every event published by the ledger core.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    TransactionStarted {
        handle: TransactionHandle,
        requestor: RequestorId,
        kind: TransactionKind,
    },
    TransactionCompleted {
        handle: TransactionHandle,
        requestor: RequestorId,
    },
    BalanceChanged {
        account: AccountType,
        old: Money,
        new: Money,
        handle: TransactionHandle,
    },
    TransactionSaved {
        kind: RecordKind,
        transaction_id: u64,
    },
    TransactionUpdated {
        kind: RecordKind,
        transaction_id: u64,
    },
    PeriodMetersCleared,
    MovementCompleted {
        movement: MovementKind,
        transaction_id: u64,
        amount: Money,
    },
}

/// Fan-out publisher for [`LedgerEvent`]s. Publishing never waits on subscribers.
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
    subscriptions: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus {
            sender,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Publishes an event to every current subscriber.
    pub fn publish(&self, event: LedgerEvent) {
        tracing::trace!(?event, "publish");
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    /// A raw receiver that observes every event published from now on.
    pub fn receiver(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    /// Runs `handler` on a background task for every event published from now on.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, owner: &str, mut handler: F)
    where
        F: FnMut(LedgerEvent) + Send + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let owner_name = owner.to_string();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(owner = %owner_name, missed, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.subscriptions
            .lock()
            .entry(owner.to_string())
            .or_default()
            .push(task);
    }

    /// Stops every handler registered by `owner`. Safe to call for unknown owners.
    pub fn unsubscribe(&self, owner: &str) {
        if let Some(tasks) = self.subscriptions.lock().remove(owner) {
            for task in tasks {
                task.abort();
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        for (_, tasks) in self.subscriptions.get_mut().drain() {
            for task in tasks {
                task.abort();
            }
        }
    }
}
