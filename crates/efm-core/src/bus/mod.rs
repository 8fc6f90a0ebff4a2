//! Signed, TTL-bounded, priority-queued message bus.
//!
//! Every message is verified before routing: signature against the
//! sender's registered key, genesis hash against the vault, TTL, hop
//! count, and a recent-delivery dedup window. Unicast messages land in the
//! recipient's per-priority FIFO mailbox; broadcast fans out a clone per
//! eligible recipient with TTL decremented. Expired and unroutable
//! messages go to the dead-letter queue and are witnessed in the audit
//! chain.
//!
//! Delivery guarantees: best-effort is a single attempt; at-least-once
//! retries unacknowledged deliveries with exponential backoff;
//! exactly-once adds receiver-side dedup by message id. Within one
//! (sender, recipient, priority) triple, FIFO mailboxes preserve send
//! order for the retried guarantees.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

mod message;

#[cfg(test)]
mod tests;

pub use message::{DeliveryGuarantee, MAX_PRIORITY, Message, MessageId, Recipient};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{AuditChain, AuditError, AuditEvent, AuditWriter, EventKind};
use crate::capsule::{CapsuleId, CapsuleStatus};
use crate::clock::Tick;
use crate::registry::CapsuleRegistry;
use crate::sandbox::SandboxEnforcer;
use crate::vault::Vault;

/// Bus configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum hops before a message is unroutable.
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    /// Ticks a message id stays in the dedup window.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_ticks: u64,

    /// Retry attempts for at-least-once and exactly-once deliveries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff in ticks; attempt `n` waits `base * 2^n`.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ticks: u64,
}

const fn default_max_hops() -> u32 {
    8
}

const fn default_dedup_window() -> u64 {
    1_000
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_backoff_base() -> u64 {
    10
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            dedup_window_ticks: default_dedup_window(),
            max_retries: default_max_retries(),
            backoff_base_ticks: default_backoff_base(),
        }
    }
}

/// Why the router refused a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteRejection {
    /// The sender is not registered.
    UnknownSender,
    /// The signature does not verify.
    InvalidSignature,
    /// The genesis hash does not match the vault.
    GenesisMismatch,
    /// TTL reached zero before routing.
    Expired,
    /// Hop count reached the maximum.
    HopLimit,
    /// The id was already routed inside the dedup window.
    Duplicate,
    /// A sandbox interceptor blocked the send.
    SandboxBlocked,
}

impl RouteRejection {
    /// Canonical reason tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownSender => "UnknownSender",
            Self::InvalidSignature => "InvalidSignature",
            Self::GenesisMismatch => "GenesisMismatch",
            Self::Expired => "Expired",
            Self::HopLimit => "HopLimit",
            Self::Duplicate => "Duplicate",
            Self::SandboxBlocked => "SandboxBlocked",
        }
    }
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterReason {
    /// TTL or hop limit exhausted.
    Expired,
    /// No eligible recipient.
    Unroutable,
    /// Retries exhausted without acknowledgement.
    RetriesExhausted,
}

impl DeadLetterReason {
    /// Canonical reason tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "Expired",
            Self::Unroutable => "Unroutable",
            Self::RetriesExhausted => "RetriesExhausted",
        }
    }
}

/// Outcome of submitting a message. A value, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered into `copies` mailboxes.
    Routed {
        /// Number of mailboxes the message (or its clones) landed in.
        copies: usize,
    },
    /// Verification failed.
    Rejected {
        /// The rejection reason.
        reason: RouteRejection,
    },
    /// The message went to the dead-letter queue.
    DeadLettered {
        /// The dead-letter reason.
        reason: DeadLetterReason,
    },
}

/// Infrastructure errors from the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Audit append failure.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Per-priority FIFO mailbox.
#[derive(Debug, Default)]
struct Mailbox {
    queues: [VecDeque<Message>; 10],
}

impl Mailbox {
    fn push(&mut self, message: Message) {
        let priority = usize::from(message.priority.min(MAX_PRIORITY));
        self.queues[priority].push_back(message);
    }

    fn pop(&mut self) -> Option<Message> {
        // Highest non-empty priority is serviced first.
        self.queues.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

struct PendingDelivery {
    message: Message,
    recipient: CapsuleId,
    attempts: u32,
    next_retry: Tick,
}

struct BusState {
    mailboxes: HashMap<CapsuleId, Mailbox>,
    dedup: HashMap<MessageId, Tick>,
    receiver_seen: HashMap<CapsuleId, HashSet<MessageId>>,
    pending: Vec<PendingDelivery>,
    dead_letters: Vec<(Message, DeadLetterReason)>,
}

/// The message bus.
pub struct MessageBus {
    vault: Arc<Vault>,
    registry: Arc<CapsuleRegistry>,
    chain: Arc<AuditChain>,
    sandbox: Option<Arc<SandboxEnforcer>>,
    config: BusConfig,
    state: Mutex<BusState>,
}

impl MessageBus {
    /// Creates a bus.
    #[must_use]
    pub fn new(
        vault: Arc<Vault>,
        registry: Arc<CapsuleRegistry>,
        chain: Arc<AuditChain>,
        sandbox: Option<Arc<SandboxEnforcer>>,
        config: BusConfig,
    ) -> Self {
        Self {
            vault,
            registry,
            chain,
            sandbox,
            config,
            state: Mutex::new(BusState {
                mailboxes: HashMap::new(),
                dedup: HashMap::new(),
                receiver_seen: HashMap::new(),
                pending: Vec::new(),
                dead_letters: Vec::new(),
            }),
        }
    }

    /// Verifies and routes a message.
    ///
    /// # Errors
    ///
    /// Returns an error only when a dead-letter audit append fails;
    /// rejections are values.
    pub fn submit(&self, message: Message, now: Tick) -> Result<RouteOutcome, BusError> {
        if let Some(reason) = self.verify(&message, now) {
            debug!(message = %message.id, reason = reason.as_str(), "message rejected");
            return Ok(RouteOutcome::Rejected { reason });
        }

        // Sandbox interception at the outbound edge.
        if let Some(sandbox) = &self.sandbox {
            if !sandbox.allow_outbound(message.sender, true) {
                warn!(message = %message.id, sender = %message.sender, "outbound blocked by sandbox");
                return Ok(RouteOutcome::Rejected {
                    reason: RouteRejection::SandboxBlocked,
                });
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.dedup.insert(message.id, now);
            Self::purge_dedup(&mut state, now, self.config.dedup_window_ticks);
        }

        match message.recipient {
            Recipient::Capsule(recipient) => self.route_unicast(message, recipient, now),
            Recipient::Broadcast => self.route_broadcast(&message, now),
        }
    }

    fn verify(&self, message: &Message, _now: Tick) -> Option<RouteRejection> {
        let Some(key) = self.vault.public_key(message.sender) else {
            return Some(RouteRejection::UnknownSender);
        };
        let Some(expected_genesis) = self.vault.genesis_hash(message.sender) else {
            return Some(RouteRejection::UnknownSender);
        };
        if message.sender_genesis != expected_genesis {
            return Some(RouteRejection::GenesisMismatch);
        }
        if !message.verify(&key) {
            return Some(RouteRejection::InvalidSignature);
        }
        if message.ttl == 0 {
            return Some(RouteRejection::Expired);
        }
        if message.hop_count >= self.config.max_hops {
            return Some(RouteRejection::HopLimit);
        }
        let state = self.state.lock().unwrap();
        if state.dedup.contains_key(&message.id) {
            return Some(RouteRejection::Duplicate);
        }
        None
    }

    fn purge_dedup(state: &mut BusState, now: Tick, window: u64) {
        state.dedup.retain(|_, seen| now.since(*seen) <= window);
    }

    fn route_unicast(
        &self,
        message: Message,
        recipient: CapsuleId,
        now: Tick,
    ) -> Result<RouteOutcome, BusError> {
        let deliverable = self
            .registry
            .status(recipient)
            .map(|status| status != CapsuleStatus::Terminated)
            .unwrap_or(false);

        if !deliverable {
            return self.dead_letter(message, DeadLetterReason::Unroutable, now);
        }

        let mut state = self.state.lock().unwrap();
        self.enqueue(&mut state, recipient, message);
        Ok(RouteOutcome::Routed { copies: 1 })
    }

    fn route_broadcast(&self, message: &Message, now: Tick) -> Result<RouteOutcome, BusError> {
        let snapshot = self.registry.snapshot();
        let recipients: Vec<CapsuleId> = snapshot
            .capsules()
            .iter()
            .filter(|view| view.id != message.sender && view.status == CapsuleStatus::Active)
            .map(|view| view.id)
            .collect();

        if recipients.is_empty() {
            return self.dead_letter(message.clone(), DeadLetterReason::Unroutable, now);
        }

        let mut copies = 0;
        let mut state = self.state.lock().unwrap();
        for recipient in recipients {
            let clone = message.fan_out_clone(recipient);
            if clone.ttl == 0 {
                state.dead_letters.push((clone, DeadLetterReason::Expired));
                continue;
            }
            self.enqueue(&mut state, recipient, clone);
            copies += 1;
        }
        Ok(RouteOutcome::Routed { copies })
    }

    fn enqueue(&self, state: &mut BusState, recipient: CapsuleId, message: Message) {
        state.mailboxes.entry(recipient).or_default().push(message);
    }

    /// Dequeues the next message for a recipient, honoring priorities and
    /// exactly-once receiver dedup.
    ///
    /// For at-least-once and exactly-once messages the delivery stays
    /// pending until [`MessageBus::ack`]; unacknowledged deliveries are
    /// retried by [`MessageBus::retry_sweep`].
    #[must_use]
    pub fn next_for(&self, recipient: CapsuleId, now: Tick) -> Option<Message> {
        let mut state = self.state.lock().unwrap();

        loop {
            let message = state.mailboxes.get_mut(&recipient)?.pop()?;

            if message.guarantee == DeliveryGuarantee::ExactlyOnce {
                let seen = state.receiver_seen.entry(recipient).or_default();
                if !seen.insert(message.id) {
                    // Receiver-side duplicate; drop and try the next one.
                    continue;
                }
            }

            if message.guarantee != DeliveryGuarantee::BestEffort
                && !state.pending.iter().any(|p| p.message.id == message.id)
            {
                let backoff = self.config.backoff_base_ticks;
                state.pending.push(PendingDelivery {
                    message: message.clone(),
                    recipient,
                    attempts: 0,
                    next_retry: now.plus(backoff),
                });
            }

            return Some(message);
        }
    }

    /// Acknowledges a delivered message, ending its retry cycle.
    pub fn ack(&self, id: MessageId) {
        let mut state = self.state.lock().unwrap();
        state.pending.retain(|p| p.message.id != id);
    }

    /// Re-enqueues unacknowledged deliveries whose backoff has elapsed;
    /// exhausted deliveries are dead-lettered.
    ///
    /// # Errors
    ///
    /// Returns an error if a dead-letter audit append fails.
    pub fn retry_sweep(&self, now: Tick) -> Result<usize, BusError> {
        let (retried, exhausted) = {
            let mut state = self.state.lock().unwrap();
            let mut keep = Vec::new();
            let mut retried = 0usize;
            let mut exhausted = Vec::new();

            let drained: Vec<_> = state.pending.drain(..).collect();
            for mut pending in drained {
                if now < pending.next_retry {
                    keep.push(pending);
                    continue;
                }
                if pending.attempts >= self.config.max_retries {
                    exhausted.push(pending.message);
                    continue;
                }
                pending.attempts += 1;
                let backoff = self.config.backoff_base_ticks << pending.attempts;
                pending.next_retry = now.plus(backoff);
                retried += 1;

                state
                    .mailboxes
                    .entry(pending.recipient)
                    .or_default()
                    .push(pending.message.clone());
                keep.push(pending);
            }
            state.pending = keep;
            (retried, exhausted)
        };

        for message in exhausted {
            self.dead_letter(message, DeadLetterReason::RetriesExhausted, now)?;
        }
        Ok(retried)
    }

    fn dead_letter(
        &self,
        message: Message,
        reason: DeadLetterReason,
        now: Tick,
    ) -> Result<RouteOutcome, BusError> {
        warn!(message = %message.id, reason = reason.as_str(), "message dead-lettered");
        self.chain.append(AuditEvent::new(
            EventKind::MessageDeadLetter,
            now,
            AuditWriter::system("bus"),
            Some(message.sender),
            &json!({ "message_id": message.id.to_string(), "reason": reason.as_str() }),
        ))?;

        let mut state = self.state.lock().unwrap();
        state.dead_letters.push((message, reason));
        Ok(RouteOutcome::DeadLettered { reason })
    }

    /// Number of messages waiting for a recipient.
    #[must_use]
    pub fn mailbox_depth(&self, recipient: CapsuleId) -> usize {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .get(&recipient)
            .map_or(0, Mailbox::len)
    }

    /// Snapshot of the dead-letter queue.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<(Message, DeadLetterReason)> {
        self.state.lock().unwrap().dead_letters.clone()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
