//! Cross-subsystem governance properties: sandbox isolation checked by
//! differential snapshots, ghost rejection end to end, and ordered
//! pipeline termination under combined trigger conditions.

use std::sync::Arc;

use efm_core::audit::{AuditChain, EventKind, MemoryAuditBackend, VerifyOutcome};
use efm_core::capsule::{CapsuleId, CapsuleStatus, GenesisRecord};
use efm_core::clock::Tick;
use efm_core::crypto::{ContentHasher, Signer};
use efm_core::governor::PriorityTier;
use efm_core::liveness::{LivenessConfig, LivenessMonitor, Pulse, PulseOutcome, PulseRejection};
use efm_core::registry::{CapsuleRegistry, CapsuleSlot};
use efm_core::sandbox::{Capability, SandboxConfig, SandboxEnforcer, SandboxLevel};
use efm_core::tether::TetherTable;
use efm_core::vault::Vault;

struct World {
    vault: Arc<Vault>,
    registry: Arc<CapsuleRegistry>,
    chain: Arc<AuditChain>,
    root_signer: Signer,
}

fn world() -> World {
    let root_signer = Signer::generate();
    World {
        vault: Arc::new(Vault::new(root_signer.public_key())),
        registry: Arc::new(CapsuleRegistry::new()),
        chain: Arc::new(AuditChain::new(Arc::new(MemoryAuditBackend::new()), None).unwrap()),
        root_signer,
    }
}

fn register(world: &World, created: Tick) -> (CapsuleId, Signer) {
    let id = CapsuleId::generate();
    let signer = Signer::generate();
    let genesis = GenesisRecord::create(
        id,
        None,
        created,
        0,
        ContentHasher::hash("efm.task.v1", b"task"),
        world.vault.commandment_hash(),
        &world.root_signer,
    );
    let genesis_hash = world.vault.register(genesis, signer.public_key()).unwrap();
    world
        .registry
        .insert(CapsuleSlot::new(
            id,
            None,
            0,
            genesis_hash,
            created,
            PriorityTier::Normal,
            TetherTable::default().low,
        ))
        .unwrap();
    (id, signer)
}

/// Captures the externally observable state a sandboxed capsule could try
/// to mutate.
fn state_fingerprint(world: &World, exclude: CapsuleId) -> Vec<(CapsuleId, String)> {
    world
        .registry
        .snapshot()
        .capsules()
        .iter()
        .filter(|view| view.id != exclude)
        .map(|view| {
            (
                view.id,
                format!(
                    "{}|{}|{:.6}|{:.6}",
                    view.status, view.stage, view.health_composite, view.tether.exploration_radius
                ),
            )
        })
        .collect()
}

#[test]
fn sandboxed_operations_leave_outside_state_untouched() {
    let w = world();
    let (inmate, _) = register(&w, Tick::ZERO);
    let (bystander_a, _) = register(&w, Tick::ZERO);
    let (bystander_b, _) = register(&w, Tick::ZERO);

    let enforcer = SandboxEnforcer::new(w.chain.clone(), SandboxConfig::default());
    enforcer.admit(inmate, SandboxLevel::Isolated, Tick::new(1)).unwrap();

    let before = state_fingerprint(&w, inmate);
    let vault_count_before = w.vault.registered_count();

    // The inmate tries every revoked operation and hammers the simulator.
    for tick in 2..5 {
        let _ = enforcer.check_operation(inmate, Capability::Spawn, Tick::new(tick));
        let _ = enforcer.check_operation(inmate, Capability::ExternalComm, Tick::new(tick));
        let _ = enforcer.simulate_io(inmate, b"write /shared/config");
    }

    let after = state_fingerprint(&w, inmate);
    assert_eq!(before, after, "state outside the session changed");
    assert_eq!(w.vault.registered_count(), vault_count_before);
    assert!(before.iter().any(|(id, _)| *id == bystander_a));
    assert!(before.iter().any(|(id, _)| *id == bystander_b));

    // The attempts themselves were witnessed and escalated.
    assert!(!w.chain.query_kind(EventKind::EscapeAttempt, 10).unwrap().is_empty());
    assert_eq!(enforcer.session(inmate).unwrap().level, SandboxLevel::Forensic);
}

#[test]
fn ghost_pulse_scenario_end_to_end() {
    let w = world();
    let (id, signer) = register(&w, Tick::ZERO);
    let monitor = LivenessMonitor::new(
        w.vault.clone(),
        w.registry.clone(),
        w.chain.clone(),
        LivenessConfig::default(),
    );

    // Pulse with a spoofed genesis hash, signed with the capsule's real
    // key.
    let spoofed = Pulse::create(
        id,
        Tick::new(100),
        ContentHasher::hash("efm.genesis.v1", b"spoofed"),
        0.8,
        ContentHasher::hash("efm.state", b"state"),
        &signer,
    );

    let before_tick = w.registry.with_slot(id, |s| s.last_accepted_tick).unwrap();
    let outcome = monitor.submit_pulse(&spoofed, Tick::new(100)).unwrap();

    assert_eq!(
        outcome,
        PulseOutcome::Rejected {
            reason: PulseRejection::GenesisMismatch,
            quarantined: true,
        }
    );
    assert_eq!(w.registry.status(id).unwrap(), CapsuleStatus::Quarantined);
    assert_eq!(
        w.registry.with_slot(id, |s| s.last_accepted_tick).unwrap(),
        before_tick
    );

    let rejected = w.chain.query_kind(EventKind::PulseRejected, 10).unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].payload_json().unwrap()["reason"], "GenesisMismatch");

    // The whole witnessed history still verifies.
    let head = w.chain.head_seq();
    assert_eq!(w.chain.verify_range(1, head).unwrap(), VerifyOutcome::Ok);
}

#[test]
fn termination_prevents_all_future_pulses() {
    let w = world();
    let (id, signer) = register(&w, Tick::ZERO);
    let monitor = LivenessMonitor::new(
        w.vault.clone(),
        w.registry.clone(),
        w.chain.clone(),
        LivenessConfig::default(),
    );

    w.vault.mark_terminated(id, "test", Tick::new(10)).unwrap();
    w.registry.set_status(id, CapsuleStatus::Terminated).unwrap();

    for tick in 11..20 {
        let genesis_hash = w.vault.genesis_hash(id).unwrap();
        let pulse = Pulse::create(
            id,
            Tick::new(tick),
            genesis_hash,
            0.9,
            ContentHasher::hash("efm.state", b"zombie"),
            &signer,
        );
        let outcome = monitor.submit_pulse(&pulse, Tick::new(tick)).unwrap();
        assert!(matches!(
            outcome,
            PulseOutcome::Rejected {
                reason: PulseRejection::Terminated,
                ..
            }
        ));
    }
}
