//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes facts that are already committed elsewhere. It gives
//! no persistence and no ordering guarantee across publishers, and a failed
//! publish never undoes the change it describes: callers log and move on.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use stockledger_core::TenantId;

use crate::tenant::TenantScoped;

/// A subscription to a bus (broadcast: every subscription sees every message).
///
/// Intended for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

impl<M: TenantScoped> Subscription<M> {
    /// Drain the queue, keeping only `tenant_id`'s messages.
    pub fn drain_for(&self, tenant_id: TenantId) -> Vec<M> {
        self.receiver
            .try_iter()
            .filter(|m| m.belongs_to(tenant_id))
            .collect()
    }
}

/// Transport-agnostic pub/sub bus.
///
/// ```text
/// unit of work commits → StockEventSink → EventBus::publish → subscribers
/// ```
///
/// Implementations must be `Send + Sync`; many request handlers publish
/// concurrently. `publish()` may fail (full channel, network error); the error
/// is surfaced so the caller can log it.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
