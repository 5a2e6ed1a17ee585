//! Serializes every ledger-affecting operation behind a single transaction handle.
use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    coordinator::{
        Dispatcher, RequestId, RequestorId, TransactionError, TransactionHandle, TransactionKind,
        dispatcher::Grant,
    },
    events::{EventBus, LedgerEvent},
    storage::{BlockAccessor, BlockStore, PersistenceLevel, StorageError},
};

const BLOCK_NAME: &str = "TransactionCoordinator";
const CURRENT_TRANSACTION: &str = "current_transaction";
const CURRENT_REQUESTOR: &str = "current_requestor";
const CURRENT_KIND: &str = "current_kind";
const LAST_REQUEST_ID: &str = "last_request_id";

/// Anything that can tell whether a handle is the one currently granted.
pub trait TransactionVerifier: Send + Sync {
    fn verify_current_transaction(&self, handle: TransactionHandle) -> bool;
}

/// The transaction that was outstanding when the process last stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingTransaction {
    pub handle: TransactionHandle,
    pub requestor: Option<RequestorId>,
    pub kind: Option<TransactionKind>,
}

struct ActiveTransaction {
    handle: TransactionHandle,
    requestor: RequestorId,
    kind: TransactionKind,
    request_id: RequestId,
}

struct PendingRequest {
    request_id: RequestId,
    requestor: RequestorId,
    kind: TransactionKind,
    notify: oneshot::Sender<TransactionHandle>,
}

struct CoordinatorState {
    current: Option<ActiveTransaction>,
    queue: VecDeque<PendingRequest>,
    last_request_id: u64,
}

/// Completion token for a transaction request.
pub struct TransactionTicket {
    request_id: RequestId,
    immediate: TransactionHandle,
    receiver: Option<oneshot::Receiver<TransactionHandle>>,
}

impl TransactionTicket {
    /// The id to use with [`TransactionCoordinator::retrieve_transaction`].
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// The handle granted at request time, or [`TransactionHandle::EMPTY`] if the request queued.
    pub fn handle(&self) -> TransactionHandle {
        self.immediate
    }

    /// Waits until the request is granted.
    pub async fn granted(self) -> Result<TransactionHandle, TransactionError> {
        match self.receiver {
            Some(receiver) => receiver.await.map_err(|_| TransactionError::Abandoned),
            None => Ok(self.immediate),
        }
    }
}

/// The arbiter of "the current transaction".
///
/// At most one handle is current at any instant. Requests arriving while a handle is out are
/// queued FIFO and granted, one at a time, as handles are released.
pub struct TransactionCoordinator {
    state: Mutex<CoordinatorState>,
    block: BlockAccessor,
    bus: Arc<EventBus>,
    dispatch: mpsc::UnboundedSender<Grant>,
    last_outstanding: Option<OutstandingTransaction>,
}

impl TransactionCoordinator {
    /// Creates the coordinator and the dispatch worker that must be spawned alongside it.
    ///
    /// A handle left outstanding by the previous run is reported through
    /// [`TransactionCoordinator::last_outstanding`] and cleared.
    pub fn new(
        store: &BlockStore,
        bus: Arc<EventBus>,
    ) -> Result<(Arc<Self>, Dispatcher), TransactionError> {
        let (block, created) =
            store.get_or_create_block(PersistenceLevel::Critical, BLOCK_NAME, 1)?;
        let last_request_id = block.get_or_default::<u64>(0, LAST_REQUEST_ID)?;

        let mut last_outstanding = None;
        if !created {
            let handle = block.get_or_default::<TransactionHandle>(0, CURRENT_TRANSACTION)?;
            if !handle.is_empty() {
                let outstanding = OutstandingTransaction {
                    handle,
                    requestor: block.get_or_default(0, CURRENT_REQUESTOR)?,
                    kind: block.get_or_default(0, CURRENT_KIND)?,
                };
                tracing::warn!(
                    %handle,
                    requestor = ?outstanding.requestor,
                    "transaction was outstanding at last shutdown, clearing it"
                );
                last_outstanding = Some(outstanding);
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let coordinator = TransactionCoordinator {
            state: Mutex::new(CoordinatorState {
                current: None,
                queue: VecDeque::new(),
                last_request_id,
            }),
            block,
            bus,
            dispatch: sender,
            last_outstanding,
        };
        if coordinator.last_outstanding.is_some() {
            coordinator.persist_idle(last_request_id)?;
        }
        Ok((Arc::new(coordinator), Dispatcher::new(receiver)))
    }

    /// Creates the coordinator and spawns its dispatch worker on the current tokio runtime.
    pub fn start(store: &BlockStore, bus: Arc<EventBus>) -> Result<Arc<Self>, TransactionError> {
        let (coordinator, dispatcher) = Self::new(store, bus)?;
        tokio::spawn(dispatcher.run());
        Ok(coordinator)
    }

    /// Requests the transaction, waiting up to `timeout` for it.
    ///
    /// Returns `None` on timeout. The request then stays queued and the caller must
    /// [`abandon`](TransactionCoordinator::abandon_transactions) it or collect it later with
    /// [`retrieve_transaction`](TransactionCoordinator::retrieve_transaction).
    pub async fn request_transaction(
        &self,
        requestor: RequestorId,
        timeout: Duration,
        kind: TransactionKind,
    ) -> Result<Option<TransactionHandle>, TransactionError> {
        let ticket = self.request_transaction_async(requestor, kind)?;
        let request_id = ticket.request_id();
        match tokio::time::timeout(timeout, ticket.granted()).await {
            Ok(Ok(handle)) => Ok(Some(handle)),
            Ok(Err(_)) => {
                tracing::debug!(%requestor, %request_id, "request abandoned while waiting");
                Ok(None)
            }
            Err(_) => {
                tracing::warn!(%requestor, %request_id, ?timeout, "transaction request timed out");
                Ok(None)
            }
        }
    }

    /// Requests the transaction without waiting.
    ///
    /// The ticket carries the handle when the coordinator was idle; otherwise the request is
    /// queued and the ticket resolves once the dispatch worker delivers the grant.
    pub fn request_transaction_async(
        &self,
        requestor: RequestorId,
        kind: TransactionKind,
    ) -> Result<TransactionTicket, TransactionError> {
        let mut state = self.state.lock();
        let holds_current = state
            .current
            .as_ref()
            .is_some_and(|active| active.requestor == requestor);
        if holds_current || state.queue.iter().any(|pending| pending.requestor == requestor) {
            return Err(TransactionError::DuplicateRequest(requestor));
        }

        let request_id = RequestId(state.last_request_id + 1);
        if state.current.is_none() && state.queue.is_empty() {
            let handle = TransactionHandle::mint();
            self.persist_grant(handle, requestor, kind, request_id.0)?;
            state.last_request_id = request_id.0;
            state.current = Some(ActiveTransaction {
                handle,
                requestor,
                kind,
                request_id,
            });
            tracing::info!(%requestor, %handle, ?kind, "transaction granted");
            self.bus.publish(LedgerEvent::TransactionStarted {
                handle,
                requestor,
                kind,
            });
            return Ok(TransactionTicket {
                request_id,
                immediate: handle,
                receiver: None,
            });
        }

        let (notify, receiver) = oneshot::channel();
        state.last_request_id = request_id.0;
        state.queue.push_back(PendingRequest {
            request_id,
            requestor,
            kind,
            notify,
        });
        tracing::debug!(%requestor, %request_id, position = state.queue.len(), "transaction request queued");
        if state.current.is_none() {
            self.grant_next(&mut state)?;
        }
        Ok(TransactionTicket {
            request_id,
            immediate: TransactionHandle::EMPTY,
            receiver: Some(receiver),
        })
    }

    /// Releases `handle`. A handle that is not current is ignored.
    ///
    /// The head of the queue, if any, is granted before this returns.
    pub fn release_transaction(&self, handle: TransactionHandle) -> Result<(), TransactionError> {
        let mut state = self.state.lock();
        let owns = !handle.is_empty()
            && state
                .current
                .as_ref()
                .is_some_and(|active| active.handle == handle);
        if !owns {
            tracing::debug!(%handle, "release of a handle that is not current ignored");
            return Ok(());
        }
        self.finish_current(&mut state)
    }

    /// Drops every queued request of `requestor` and releases its handle if it holds one.
    ///
    /// Idempotent; safe for requestors with nothing outstanding.
    pub fn abandon_transactions(&self, requestor: RequestorId) -> Result<(), TransactionError> {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.retain(|pending| pending.requestor != requestor);
        let removed = before - state.queue.len();
        let owns = state
            .current
            .as_ref()
            .is_some_and(|active| active.requestor == requestor);
        if removed > 0 || owns {
            tracing::info!(%requestor, removed, owns, "transactions abandoned");
        }
        if owns {
            self.finish_current(&mut state)?;
        }
        Ok(())
    }

    /// Whether `handle` is the non-empty, currently granted handle.
    pub fn verify_current_transaction(&self, handle: TransactionHandle) -> bool {
        !handle.is_empty()
            && self
                .state
                .lock()
                .current
                .as_ref()
                .is_some_and(|active| active.handle == handle)
    }

    /// Returns the handle granted to `request_id`, provided it is still current.
    pub fn retrieve_transaction(
        &self,
        request_id: RequestId,
    ) -> Result<TransactionHandle, TransactionError> {
        self.state
            .lock()
            .current
            .as_ref()
            .filter(|active| active.request_id == request_id)
            .map(|active| active.handle)
            .ok_or(TransactionError::NotGranted(request_id))
    }

    /// The owner and kind of the current transaction, if any.
    pub fn current_owner(&self) -> Option<(RequestorId, TransactionKind)> {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|active| (active.requestor, active.kind))
    }

    /// Number of requests waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// The handle that was outstanding when the previous run stopped, if any.
    pub fn last_outstanding(&self) -> Option<OutstandingTransaction> {
        self.last_outstanding
    }

    fn finish_current(&self, state: &mut CoordinatorState) -> Result<(), TransactionError> {
        let Some(active) = state.current.take() else {
            return Ok(());
        };
        if let Err(err) = self.persist_idle(state.last_request_id) {
            state.current = Some(active);
            return Err(err.into());
        }
        tracing::info!(requestor = %active.requestor, handle = %active.handle, "transaction released");
        self.bus.publish(LedgerEvent::TransactionCompleted {
            handle: active.handle,
            requestor: active.requestor,
        });
        self.grant_next(state)
    }

    fn grant_next(&self, state: &mut CoordinatorState) -> Result<(), TransactionError> {
        let Some(next) = state.queue.pop_front() else {
            return Ok(());
        };
        let handle = TransactionHandle::mint();
        if let Err(err) =
            self.persist_grant(handle, next.requestor, next.kind, state.last_request_id)
        {
            state.queue.push_front(next);
            return Err(err.into());
        }

        let PendingRequest {
            request_id,
            requestor,
            kind,
            notify,
        } = next;
        state.current = Some(ActiveTransaction {
            handle,
            requestor,
            kind,
            request_id,
        });
        tracing::info!(%requestor, %handle, ?kind, %request_id, "queued transaction granted");
        self.bus.publish(LedgerEvent::TransactionStarted {
            handle,
            requestor,
            kind,
        });
        let grant = Grant {
            request_id,
            requestor,
            handle,
            notify,
        };
        if self.dispatch.send(grant).is_err() {
            tracing::warn!(%requestor, "dispatcher stopped, grant must be retrieved");
        }
        Ok(())
    }

    fn persist_grant(
        &self,
        handle: TransactionHandle,
        requestor: RequestorId,
        kind: TransactionKind,
        last_request_id: u64,
    ) -> Result<(), StorageError> {
        let mut tx = self.block.start_transaction();
        tx.set(0, CURRENT_TRANSACTION, &handle)?;
        tx.set(0, CURRENT_REQUESTOR, &Some(requestor))?;
        tx.set(0, CURRENT_KIND, &Some(kind))?;
        tx.set(0, LAST_REQUEST_ID, &last_request_id)?;
        tx.commit_immediate()
    }

    fn persist_idle(&self, last_request_id: u64) -> Result<(), StorageError> {
        let mut tx = self.block.start_transaction();
        tx.set(0, CURRENT_TRANSACTION, &TransactionHandle::EMPTY)?;
        tx.set(0, CURRENT_REQUESTOR, &None::<RequestorId>)?;
        tx.set(0, CURRENT_KIND, &None::<TransactionKind>)?;
        tx.set(0, LAST_REQUEST_ID, &last_request_id)?;
        tx.commit_immediate()
    }
}

impl TransactionVerifier for TransactionCoordinator {
    fn verify_current_transaction(&self, handle: TransactionHandle) -> bool {
        TransactionCoordinator::verify_current_transaction(self, handle)
    }
}
