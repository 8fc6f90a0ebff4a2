//! Operator override interface.
//!
//! The gardener channel is the one path that no capsule, sandbox, or
//! circuit breaker may block or delay. Commands are authenticated against
//! registered operator credentials, authorized by operator level, logged to
//! the audit chain BEFORE execution, and bounded to the configured latency
//! budget from authenticated receipt to observable effect.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditChain, AuditError, AuditEvent, AuditWriter, EventKind};
use crate::capsule::{CapsuleId, CapsuleStatus};
use crate::clock::Tick;
use crate::registry::{CapsuleRegistry, RegistryError};
use crate::vault::{Vault, VaultError};

/// Default override latency budget in milliseconds.
pub const DEFAULT_LATENCY_BUDGET_MS: u64 = 100;

/// Operator authority level, 1 (view) through 5 (full control).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorityLevel(pub u8);

impl AuthorityLevel {
    /// The highest level.
    pub const MAX: Self = Self(5);
}

/// An operator command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GardenerCommand {
    /// Inspect a capsule.
    View {
        /// The capsule to inspect.
        target: CapsuleId,
    },
    /// Attach an advisory note to a capsule's record.
    Advisory {
        /// The capsule.
        target: CapsuleId,
        /// Advisory payload.
        payload: String,
    },
    /// Quarantine a capsule.
    Quarantine {
        /// The capsule.
        target: CapsuleId,
    },
    /// Terminate a capsule.
    Terminate {
        /// The capsule.
        target: CapsuleId,
        /// Reason recorded in the tombstone.
        reason: String,
    },
    /// Stop accepting new pipeline work.
    Halt,
    /// Begin orderly process shutdown.
    Shutdown,
    /// Clear a halt and resume intake.
    Reset,
}

impl GardenerCommand {
    /// Minimum authority level for the command.
    #[must_use]
    pub const fn required_level(&self) -> AuthorityLevel {
        match self {
            Self::View { .. } => AuthorityLevel(1),
            Self::Advisory { .. } => AuthorityLevel(2),
            Self::Quarantine { .. } => AuthorityLevel(3),
            Self::Terminate { .. } | Self::Halt => AuthorityLevel(4),
            Self::Shutdown | Self::Reset => AuthorityLevel(5),
        }
    }

    /// High-severity commands require an explicit confirmation parameter.
    #[must_use]
    pub const fn requires_confirmation(&self) -> bool {
        matches!(
            self,
            Self::Terminate { .. } | Self::Halt | Self::Shutdown | Self::Reset
        )
    }

    /// Command name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::View { .. } => "view",
            Self::Advisory { .. } => "advisory",
            Self::Quarantine { .. } => "quarantine",
            Self::Terminate { .. } => "terminate",
            Self::Halt => "halt",
            Self::Shutdown => "shutdown",
            Self::Reset => "reset",
        }
    }
}

/// An authenticated operator request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GardenerRequest {
    /// Operator identity.
    pub operator_id: String,

    /// Operator token (verified against the registered credential).
    pub token: String,

    /// Confirmation parameter for high-severity commands.
    pub confirmation: bool,

    /// Client-chosen correlation id echoed in the response.
    pub correlation_id: String,

    /// The command.
    pub command: GardenerCommand,
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GardenerStatus {
    /// The command executed.
    Ok,
    /// Unknown operator or bad token.
    AuthFailed,
    /// The operator's level is below the command's requirement.
    InsufficientAuthorization,
    /// A high-severity command arrived without confirmation.
    ConfirmationRequired,
    /// The target capsule does not exist.
    NotFound,
    /// The target is already in the requested state.
    Conflict,
    /// The runtime could not admit the command.
    Overloaded,
}

/// Response to an operator request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GardenerResponse {
    /// Echoed correlation id.
    pub correlation_id: String,

    /// Status code.
    pub status: GardenerStatus,

    /// Capsules affected by the command.
    pub affected: Vec<CapsuleId>,

    /// Sequence numbers of the audit entries produced.
    pub audit_ids: Vec<u64>,

    /// Observed latency from authenticated receipt to effect.
    pub latency_ms: u64,

    /// Wall-clock receipt time, for operator-facing records only; the
    /// governance plane itself runs on logical ticks.
    pub received_at: DateTime<Utc>,
}

/// Infrastructure errors from the override channel.
#[derive(Debug, Error)]
pub enum GardenerError {
    /// The pre-execution audit entry could not be committed; the command
    /// did not execute.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

struct OperatorCredential {
    token_hash: [u8; 32],
    level: AuthorityLevel,
}

/// Process-level run state toggled by halt and shutdown commands.
#[derive(Debug, Default)]
pub struct RunState {
    halted: AtomicBool,
    shutdown: AtomicBool,
}

impl RunState {
    /// Creates a running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a halt has committed; the pipeline stops accepting work.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// True once shutdown has committed.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// The override interface.
pub struct Gardener {
    vault: Arc<Vault>,
    registry: Arc<CapsuleRegistry>,
    chain: Arc<AuditChain>,
    run_state: Arc<RunState>,
    operators: RwLock<HashMap<String, OperatorCredential>>,
    latency_budget_ms: u64,
}

impl Gardener {
    /// Creates the interface.
    #[must_use]
    pub fn new(
        vault: Arc<Vault>,
        registry: Arc<CapsuleRegistry>,
        chain: Arc<AuditChain>,
        run_state: Arc<RunState>,
        latency_budget_ms: u64,
    ) -> Self {
        Self {
            vault,
            registry,
            chain,
            run_state,
            operators: RwLock::new(HashMap::new()),
            latency_budget_ms,
        }
    }

    /// Registers an operator credential.
    pub fn register_operator(
        &self,
        operator_id: impl Into<String>,
        token: &str,
        level: AuthorityLevel,
    ) {
        let mut operators = self.operators.write().unwrap();
        operators.insert(
            operator_id.into(),
            OperatorCredential {
                token_hash: Self::hash_token(token),
                level,
            },
        );
    }

    fn hash_token(token: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"efm.operator.token.v1");
        hasher.update([0x1f]);
        hasher.update(token.as_bytes());
        hasher.finalize().into()
    }

    fn authenticate(&self, request: &GardenerRequest) -> Option<AuthorityLevel> {
        let operators = self.operators.read().unwrap();
        let credential = operators.get(&request.operator_id)?;
        let presented = Self::hash_token(&request.token);
        let matches: bool = presented.ct_eq(&credential.token_hash).into();
        matches.then_some(credential.level)
    }

    /// Executes an operator request.
    ///
    /// The command is logged before execution; nothing in the runtime may
    /// veto it. Authentication and authorization failures are themselves
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pre-execution audit entry cannot be
    /// committed, in which case the command did not execute.
    pub fn execute(
        &self,
        request: &GardenerRequest,
        now: Tick,
    ) -> Result<GardenerResponse, GardenerError> {
        let received = Instant::now();

        let Some(level) = self.authenticate(request) else {
            warn!(operator = %request.operator_id, "override authentication failed");
            let seq = self.log_command(request, now, "AuthFailed")?;
            return Ok(self.respond(request, GardenerStatus::AuthFailed, vec![], vec![seq], received));
        };

        if level < request.command.required_level() {
            let seq = self.log_command(request, now, "InsufficientAuthorization")?;
            return Ok(self.respond(
                request,
                GardenerStatus::InsufficientAuthorization,
                vec![],
                vec![seq],
                received,
            ));
        }

        if request.command.requires_confirmation() && !request.confirmation {
            let seq = self.log_command(request, now, "ConfirmationRequired")?;
            return Ok(self.respond(
                request,
                GardenerStatus::ConfirmationRequired,
                vec![],
                vec![seq],
                received,
            ));
        }

        // Pre-execution log: the command is witnessed before any effect.
        let pre_seq = self.log_command(request, now, "accepted")?;

        let (status, affected, mut audit_ids) = self.apply(request, now)?;
        audit_ids.insert(0, pre_seq);

        info!(
            operator = %request.operator_id,
            command = request.command.name(),
            ?status,
            "override executed"
        );
        Ok(self.respond(request, status, affected, audit_ids, received))
    }

    fn log_command(
        &self,
        request: &GardenerRequest,
        now: Tick,
        disposition: &str,
    ) -> Result<u64, GardenerError> {
        let target = match &request.command {
            GardenerCommand::View { target }
            | GardenerCommand::Advisory { target, .. }
            | GardenerCommand::Quarantine { target }
            | GardenerCommand::Terminate { target, .. } => Some(*target),
            _ => None,
        };
        let (seq, _) = self.chain.append(AuditEvent::new(
            EventKind::GardenerOverride,
            now,
            AuditWriter::system("gardener"),
            target,
            &json!({
                "operator_id": request.operator_id,
                "command": request.command.name(),
                "correlation_id": request.correlation_id,
                "disposition": disposition,
            }),
        ))?;
        Ok(seq)
    }

    #[allow(clippy::too_many_lines)]
    fn apply(
        &self,
        request: &GardenerRequest,
        now: Tick,
    ) -> Result<(GardenerStatus, Vec<CapsuleId>, Vec<u64>), GardenerError> {
        match &request.command {
            GardenerCommand::View { target } => {
                if self.registry.status(*target).is_ok() {
                    Ok((GardenerStatus::Ok, vec![*target], vec![]))
                } else {
                    Ok((GardenerStatus::NotFound, vec![], vec![]))
                }
            },

            GardenerCommand::Advisory { target, payload } => {
                if self.registry.status(*target).is_err() {
                    return Ok((GardenerStatus::NotFound, vec![], vec![]));
                }
                let (seq, _) = self.chain.append(AuditEvent::new(
                    EventKind::GardenerOverride,
                    now,
                    AuditWriter::system("gardener"),
                    Some(*target),
                    &json!({ "advisory": payload }),
                ))?;
                Ok((GardenerStatus::Ok, vec![*target], vec![seq]))
            },

            GardenerCommand::Quarantine { target } => {
                match self.registry.status(*target) {
                    Err(_) => Ok((GardenerStatus::NotFound, vec![], vec![])),
                    Ok(CapsuleStatus::Quarantined | CapsuleStatus::Terminated) => {
                        Ok((GardenerStatus::Conflict, vec![], vec![]))
                    },
                    Ok(CapsuleStatus::Active) => {
                        self.registry
                            .set_status(*target, CapsuleStatus::Quarantined)
                            .map_err(|e| Self::registry_fault(&e))?;
                        let (seq, _) = self.chain.append(AuditEvent::new(
                            EventKind::QuarantineEntered,
                            now,
                            AuditWriter::system("gardener"),
                            Some(*target),
                            &json!({ "cause": "operator_override" }),
                        ))?;
                        Ok((GardenerStatus::Ok, vec![*target], vec![seq]))
                    },
                }
            },

            GardenerCommand::Terminate { target, reason } => {
                match self.registry.status(*target) {
                    Err(_) => Ok((GardenerStatus::NotFound, vec![], vec![])),
                    Ok(CapsuleStatus::Terminated) => Ok((GardenerStatus::Conflict, vec![], vec![])),
                    Ok(_) => {
                        self.registry
                            .set_status(*target, CapsuleStatus::Terminated)
                            .map_err(|e| Self::registry_fault(&e))?;
                        match self.vault.mark_terminated(*target, reason.clone(), now) {
                            Ok(()) | Err(VaultError::IdAlreadyTerminated { .. }) => {},
                            Err(e) => return Err(Self::vault_fault(&e)),
                        }
                        let (seq, _) = self.chain.append(AuditEvent::new(
                            EventKind::CapsuleTerminated,
                            now,
                            AuditWriter::system("gardener"),
                            Some(*target),
                            &json!({ "reason": reason }),
                        ))?;
                        Ok((GardenerStatus::Ok, vec![*target], vec![seq]))
                    },
                }
            },

            GardenerCommand::Halt => {
                self.run_state.halted.store(true, Ordering::Release);
                let (seq, _) = self.chain.append(AuditEvent::new(
                    EventKind::SystemHaltCommitted,
                    now,
                    AuditWriter::system("gardener"),
                    None,
                    &json!({ "operator_id": request.operator_id }),
                ))?;
                Ok((GardenerStatus::Ok, vec![], vec![seq]))
            },

            GardenerCommand::Shutdown => {
                self.run_state.halted.store(true, Ordering::Release);
                self.run_state.shutdown.store(true, Ordering::Release);
                let (seq, _) = self.chain.append(AuditEvent::new(
                    EventKind::SystemShutdown,
                    now,
                    AuditWriter::system("gardener"),
                    None,
                    &json!({ "operator_id": request.operator_id }),
                ))?;
                Ok((GardenerStatus::Ok, vec![], vec![seq]))
            },

            GardenerCommand::Reset => {
                let was_halted = self.run_state.halted.swap(false, Ordering::AcqRel);
                if was_halted {
                    Ok((GardenerStatus::Ok, vec![], vec![]))
                } else {
                    Ok((GardenerStatus::Conflict, vec![], vec![]))
                }
            },
        }
    }

    // Registry/vault faults inside an override are infrastructure
    // failures; they surface through the audit error channel.
    fn registry_fault(e: &RegistryError) -> GardenerError {
        GardenerError::Audit(AuditError::AppendFailed {
            details: format!("registry fault during override: {e}"),
        })
    }

    fn vault_fault(e: &VaultError) -> GardenerError {
        GardenerError::Audit(AuditError::AppendFailed {
            details: format!("vault fault during override: {e}"),
        })
    }

    fn respond(
        &self,
        request: &GardenerRequest,
        status: GardenerStatus,
        affected: Vec<CapsuleId>,
        audit_ids: Vec<u64>,
        received: Instant,
    ) -> GardenerResponse {
        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = received.elapsed().as_millis() as u64;
        if latency_ms > self.latency_budget_ms {
            warn!(
                latency_ms,
                budget_ms = self.latency_budget_ms,
                "override exceeded latency budget"
            );
        }
        GardenerResponse {
            correlation_id: request.correlation_id.clone(),
            status,
            affected,
            audit_ids,
            latency_ms,
            received_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for Gardener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gardener")
            .field("latency_budget_ms", &self.latency_budget_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
