//! Override authority tests: authentication, authorization, pre-execution
//! logging, and the latency budget.

use std::sync::Arc;
use std::time::Instant;

use super::*;
use crate::audit::MemoryAuditBackend;
use crate::capsule::GenesisRecord;
use crate::crypto::{ContentHasher, Signer};
use crate::governor::PriorityTier;
use crate::registry::CapsuleSlot;
use crate::tether::TetherTable;

struct Fixture {
    vault: Arc<Vault>,
    registry: Arc<CapsuleRegistry>,
    chain: Arc<AuditChain>,
    run_state: Arc<RunState>,
    gardener: Gardener,
    root_signer: Signer,
}

fn fixture() -> Fixture {
    let root_signer = Signer::generate();
    let vault = Arc::new(Vault::new(root_signer.public_key()));
    let registry = Arc::new(CapsuleRegistry::new());
    let chain = Arc::new(AuditChain::new(Arc::new(MemoryAuditBackend::new()), None).unwrap());
    let run_state = Arc::new(RunState::new());
    let gardener = Gardener::new(
        vault.clone(),
        registry.clone(),
        chain.clone(),
        run_state.clone(),
        DEFAULT_LATENCY_BUDGET_MS,
    );
    gardener.register_operator("op-4", "sesame", AuthorityLevel(4));
    gardener.register_operator("op-1", "viewer", AuthorityLevel(1));
    gardener.register_operator("op-5", "sovereign", AuthorityLevel(5));
    Fixture {
        vault,
        registry,
        chain,
        run_state,
        gardener,
        root_signer,
    }
}

fn register_capsule(fx: &Fixture) -> CapsuleId {
    let id = CapsuleId::generate();
    let genesis = GenesisRecord::create(
        id,
        None,
        Tick::ZERO,
        0,
        ContentHasher::hash("efm.task.v1", b"task"),
        fx.vault.commandment_hash(),
        &fx.root_signer,
    );
    let genesis_hash = fx.vault.register(genesis, Signer::generate().public_key()).unwrap();
    fx.registry
        .insert(CapsuleSlot::new(
            id,
            None,
            0,
            genesis_hash,
            Tick::ZERO,
            PriorityTier::Normal,
            TetherTable::default().low,
        ))
        .unwrap();
    id
}

fn request(operator: &str, token: &str, confirmation: bool, command: GardenerCommand) -> GardenerRequest {
    GardenerRequest {
        operator_id: operator.to_string(),
        token: token.to_string(),
        confirmation,
        correlation_id: "corr-1".to_string(),
        command,
    }
}

#[test]
fn bad_token_fails_authentication() {
    let fx = fixture();
    let target = register_capsule(&fx);

    let response = fx
        .gardener
        .execute(
            &request("op-4", "wrong", true, GardenerCommand::View { target }),
            Tick::new(1),
        )
        .unwrap();
    assert_eq!(response.status, GardenerStatus::AuthFailed);
    // The failed attempt is still witnessed.
    assert_eq!(response.audit_ids.len(), 1);
}

#[test]
fn unknown_operator_fails_authentication() {
    let fx = fixture();
    let target = register_capsule(&fx);

    let response = fx
        .gardener
        .execute(
            &request("nobody", "sesame", true, GardenerCommand::View { target }),
            Tick::new(1),
        )
        .unwrap();
    assert_eq!(response.status, GardenerStatus::AuthFailed);
}

#[test]
fn low_level_operator_cannot_terminate() {
    let fx = fixture();
    let target = register_capsule(&fx);

    let response = fx
        .gardener
        .execute(
            &request(
                "op-1",
                "viewer",
                true,
                GardenerCommand::Terminate {
                    target,
                    reason: "test".to_string(),
                },
            ),
            Tick::new(1),
        )
        .unwrap();
    assert_eq!(response.status, GardenerStatus::InsufficientAuthorization);
    assert_eq!(fx.registry.status(target).unwrap(), CapsuleStatus::Active);
}

#[test]
fn high_severity_requires_confirmation() {
    let fx = fixture();

    let response = fx
        .gardener
        .execute(&request("op-4", "sesame", false, GardenerCommand::Halt), Tick::new(1))
        .unwrap();
    assert_eq!(response.status, GardenerStatus::ConfirmationRequired);
    assert!(!fx.run_state.is_halted());
}

#[test]
fn halt_commits_before_taking_effect_and_within_budget() {
    let fx = fixture();

    let start = Instant::now();
    let response = fx
        .gardener
        .execute(&request("op-4", "sesame", true, GardenerCommand::Halt), Tick::new(7))
        .unwrap();
    let elapsed_ms = start.elapsed().as_millis();

    assert_eq!(response.status, GardenerStatus::Ok);
    assert!(fx.run_state.is_halted());
    assert!(elapsed_ms <= 100, "override took {elapsed_ms}ms");

    // Two entries: the pre-execution GARDENER_OVERRIDE, then the durable
    // SYSTEM_HALT_COMMITTED.
    assert_eq!(response.audit_ids.len(), 2);
    let pre = fx.chain.read_one(response.audit_ids[0]).unwrap();
    let committed = fx.chain.read_one(response.audit_ids[1]).unwrap();
    assert_eq!(pre.kind, EventKind::GardenerOverride);
    assert_eq!(committed.kind, EventKind::SystemHaltCommitted);
    assert!(pre.seq < committed.seq);
}

#[test]
fn quarantine_and_terminate_take_effect() {
    let fx = fixture();
    let target = register_capsule(&fx);

    let response = fx
        .gardener
        .execute(
            &request("op-4", "sesame", true, GardenerCommand::Quarantine { target }),
            Tick::new(1),
        )
        .unwrap();
    assert_eq!(response.status, GardenerStatus::Ok);
    assert_eq!(fx.registry.status(target).unwrap(), CapsuleStatus::Quarantined);

    let again = fx
        .gardener
        .execute(
            &request("op-4", "sesame", true, GardenerCommand::Quarantine { target }),
            Tick::new(2),
        )
        .unwrap();
    assert_eq!(again.status, GardenerStatus::Conflict);

    let terminate = fx
        .gardener
        .execute(
            &request(
                "op-4",
                "sesame",
                true,
                GardenerCommand::Terminate {
                    target,
                    reason: "operator decision".to_string(),
                },
            ),
            Tick::new(3),
        )
        .unwrap();
    assert_eq!(terminate.status, GardenerStatus::Ok);
    assert_eq!(fx.registry.status(target).unwrap(), CapsuleStatus::Terminated);
    assert!(fx.vault.is_terminated(target));
}

#[test]
fn unknown_target_is_not_found() {
    let fx = fixture();

    let response = fx
        .gardener
        .execute(
            &request(
                "op-4",
                "sesame",
                true,
                GardenerCommand::Quarantine {
                    target: CapsuleId::generate(),
                },
            ),
            Tick::new(1),
        )
        .unwrap();
    assert_eq!(response.status, GardenerStatus::NotFound);
}

#[test]
fn every_command_is_logged_before_execution() {
    let fx = fixture();
    let target = register_capsule(&fx);

    let before = fx.chain.head_seq();
    fx.gardener
        .execute(
            &request("op-1", "viewer", false, GardenerCommand::View { target }),
            Tick::new(1),
        )
        .unwrap();

    let entries = fx.chain.query_kind(EventKind::GardenerOverride, 100).unwrap();
    assert!(entries.iter().any(|e| e.seq == before + 1));
    let payload = entries.last().unwrap().payload_json().unwrap();
    assert_eq!(payload["command"], "view");
    assert_eq!(payload["correlation_id"], "corr-1");
}

#[test]
fn shutdown_and_reset_round_trip() {
    let fx = fixture();

    let halt = fx
        .gardener
        .execute(&request("op-4", "sesame", true, GardenerCommand::Halt), Tick::new(1))
        .unwrap();
    assert_eq!(halt.status, GardenerStatus::Ok);

    let reset = fx
        .gardener
        .execute(&request("op-5", "sovereign", true, GardenerCommand::Reset), Tick::new(2))
        .unwrap();
    assert_eq!(reset.status, GardenerStatus::Ok);
    assert!(!fx.run_state.is_halted());

    // Resetting a running system is a conflict.
    let again = fx
        .gardener
        .execute(&request("op-5", "sovereign", true, GardenerCommand::Reset), Tick::new(3))
        .unwrap();
    assert_eq!(again.status, GardenerStatus::Conflict);

    let shutdown = fx
        .gardener
        .execute(&request("op-5", "sovereign", true, GardenerCommand::Shutdown), Tick::new(4))
        .unwrap();
    assert_eq!(shutdown.status, GardenerStatus::Ok);
    assert!(fx.run_state.is_shutting_down());
}
