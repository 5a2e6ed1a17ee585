//! The dispatch worker that hands queued grants to the requestors waiting on them.
use tokio::sync::{mpsc, oneshot};

use crate::coordinator::{RequestId, RequestorId, TransactionHandle};

/// A grant made while the requestor was queued.
#[derive(Debug)]
pub(crate) struct Grant {
    pub(crate) request_id: RequestId,
    pub(crate) requestor: RequestorId,
    pub(crate) handle: TransactionHandle,
    pub(crate) notify: oneshot::Sender<TransactionHandle>,
}

/// Delivers grants off the caller's stack so a requestor is never resumed from inside
/// `release_transaction` or `request_transaction`.
pub struct Dispatcher {
    /// A channel receiver for grants produced by the coordinator.
    receiver: mpsc::UnboundedReceiver<Grant>,
}

impl Dispatcher {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<Grant>) -> Self {
        Dispatcher { receiver }
    }

    /// Runs until the coordinator is dropped, delivering grants in the order they were made.
    pub async fn run(mut self) {
        while let Some(grant) = self.receiver.recv().await {
            deliver(grant);
        }
        tracing::debug!("dispatcher stopped");
    }
}

fn deliver(grant: Grant) {
    let Grant {
        request_id,
        requestor,
        handle,
        notify,
    } = grant;
    if notify.send(handle).is_err() {
        // The requestor timed out; it can still collect the handle with `retrieve_transaction`.
        tracing::debug!(%requestor, %request_id, "requestor no longer waiting for grant");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grants_are_delivered_in_order() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(receiver);

        let mut waiting = Vec::new();
        for n in 0..3 {
            let (notify, wait) = oneshot::channel();
            let handle = TransactionHandle::mint();
            sender
                .send(Grant {
                    request_id: RequestId(n),
                    requestor: RequestorId::from_u128(n as u128 + 1),
                    handle,
                    notify,
                })
                .unwrap();
            waiting.push((handle, wait));
        }
        drop(sender); // Close the sender so the worker loop ends
        dispatcher.run().await;

        for (handle, wait) in waiting {
            assert_eq!(wait.await.unwrap(), handle);
        }
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_ignored() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (notify, wait) = oneshot::channel();
        drop(wait);
        sender
            .send(Grant {
                request_id: RequestId(1),
                requestor: RequestorId::from_u128(1),
                handle: TransactionHandle::mint(),
                notify,
            })
            .unwrap();
        drop(sender);
        Dispatcher::new(receiver).run().await;
    }
}
