//! Code broker: hands one operator-supplied code to exactly one waiting login step.
//!
//! Per (subject, kind) channel the lifecycle is
//! `idle -> subscribed -> waiting -> delivered | timed out | cancelled -> idle`.
//!
//! `subscribe` creates the delivery slot before the caller triggers the action that makes the
//! portal send a code. A code published between `subscribe` and `wait_for_code` is buffered in
//! the slot, so it cannot be lost.

mod intake;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

pub use intake::{CodeIntake, DeliveryReceipt, extract_code};

use crate::domain::{CodeKind, CodeMessage, CodeRequest, channel_name};
use crate::ports::Clock;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{channel} already has a pending request")]
    AlreadySubscribed { channel: String },

    #[error("{channel} already has a waiter attached")]
    AlreadyWaiting { channel: String },

    #[error("timed out after {waited:?} waiting for {kind} code for {subject}")]
    Timeout {
        subject: String,
        kind: CodeKind,
        waited: Duration,
    },

    #[error("wait on {channel} was cancelled")]
    Cancelled { channel: String },

    #[error("code broker is shutting down")]
    ShuttingDown,
}

struct Slot {
    ticket: u64,
    request: CodeRequest,
    sender: Option<oneshot::Sender<CodeMessage>>,
    /// Taken by the waiter; `None` once a waiter is attached.
    receiver: Option<oneshot::Receiver<CodeMessage>>,
}

/// Slots are keyed by the raw subject; `channel_name` is only a label for logs and errors.
type SlotKey = (String, CodeKind);

pub struct CodeBroker {
    slots: Mutex<HashMap<SlotKey, Slot>>,
    next_ticket: AtomicU64,
    shutting_down: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl CodeBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            clock,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SlotKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_slot(&self, subject: &str, kind: CodeKind) -> Slot {
        let (sender, receiver) = oneshot::channel();
        Slot {
            ticket: self.next_ticket.fetch_add(1, Ordering::Relaxed),
            request: CodeRequest {
                subject: subject.to_string(),
                kind,
                created_at: self.clock.now(),
                timeout_at: None,
            },
            sender: Some(sender),
            receiver: Some(receiver),
        }
    }

    /// Open the delivery slot for (subject, kind).
    ///
    /// Must return before the action that triggers code dispatch. A second subscription for
    /// a channel that still has a pending request is rejected.
    pub fn subscribe(&self, subject: &str, kind: CodeKind) -> Result<CodeRequest, BrokerError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(BrokerError::ShuttingDown);
        }
        let channel = channel_name(subject, kind);
        let key = (subject.to_string(), kind);
        let mut slots = self.slots();
        if slots.contains_key(&key) {
            tracing::warn!(%channel, "subscription rejected, request already pending");
            return Err(BrokerError::AlreadySubscribed { channel });
        }
        let slot = self.open_slot(subject, kind);
        let request = slot.request.clone();
        slots.insert(key, slot);
        tracing::debug!(%channel, "subscribed");
        Ok(request)
    }

    /// Block until the code for (subject, kind) arrives or `timeout` elapses.
    ///
    /// The slot is released on every exit path, including when this future is dropped.
    /// Waiting without a prior `subscribe` subscribes implicitly.
    pub async fn wait_for_code(
        &self,
        subject: &str,
        kind: CodeKind,
        timeout: Duration,
    ) -> Result<String, BrokerError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(BrokerError::ShuttingDown);
        }
        let channel = channel_name(subject, kind);
        let key = (subject.to_string(), kind);
        let (ticket, receiver) = {
            let mut slots = self.slots();
            let slot = slots.entry(key.clone()).or_insert_with(|| {
                tracing::warn!(%channel, "waiting without subscription, subscribing now");
                self.open_slot(subject, kind)
            });
            let Some(receiver) = slot.receiver.take() else {
                return Err(BrokerError::AlreadyWaiting { channel });
            };
            slot.request.timeout_at =
                Some(self.clock.now() + chrono::Duration::from_std(timeout).unwrap_or_default());
            (slot.ticket, receiver)
        };

        let _release = Release {
            broker: self,
            key: &key,
            ticket,
        };

        tracing::info!(%channel, ?timeout, "waiting for code");
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(message)) => {
                tracing::info!(%channel, "code received");
                Ok(message.code)
            }
            Ok(Err(_)) if self.shutting_down.load(Ordering::Acquire) => {
                Err(BrokerError::ShuttingDown)
            }
            Ok(Err(_)) => Err(BrokerError::Cancelled { channel: channel.clone() }),
            Err(_) => {
                tracing::warn!(%channel, ?timeout, "code wait timed out");
                Err(BrokerError::Timeout {
                    subject: subject.to_string(),
                    kind,
                    waited: timeout,
                })
            }
        }
    }

    /// Deliver `code` to the pending request for (subject, kind).
    ///
    /// Returns the number of recipients: 1 if a request was pending, 0 otherwise
    /// (the code is discarded).
    pub fn publish(&self, subject: &str, kind: CodeKind, code: &str) -> usize {
        let channel = channel_name(subject, kind);
        let mut slots = self.slots();
        let Some(sender) = slots
            .get_mut(&(subject.to_string(), kind))
            .and_then(|slot| slot.sender.take())
        else {
            tracing::info!(%channel, "no subscriber for code, discarding");
            return 0;
        };
        let message = CodeMessage {
            subject: subject.to_string(),
            kind,
            code: code.to_string(),
            timestamp: self.clock.now(),
        };
        match sender.send(message) {
            Ok(()) => {
                tracing::debug!(%channel, "code delivered");
                1
            }
            Err(_) => 0,
        }
    }

    /// Release the slot for (subject, kind). An attached waiter fails with `Cancelled`.
    pub fn cancel(&self, subject: &str, kind: CodeKind) -> bool {
        let channel = channel_name(subject, kind);
        let removed = self.slots().remove(&(subject.to_string(), kind)).is_some();
        if removed {
            tracing::debug!(%channel, "subscription cancelled");
        }
        removed
    }

    pub fn is_subscribed(&self, subject: &str, kind: CodeKind) -> bool {
        self.slots().contains_key(&(subject.to_string(), kind))
    }

    pub fn pending_count(&self) -> usize {
        self.slots().len()
    }

    /// Reject new subscriptions and end every pending wait.
    pub fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let drained = self.slots().drain().count();
        if drained > 0 {
            tracing::info!(drained, "code broker shut down with pending requests");
        }
        drained
    }
}

/// Removes the slot a waiter owned, unless it has since been replaced.
struct Release<'a> {
    broker: &'a CodeBroker,
    key: &'a SlotKey,
    ticket: u64,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let mut slots = self.broker.slots();
        if slots.get(self.key).is_some_and(|s| s.ticket == self.ticket) {
            slots.remove(self.key);
        }
    }
}
