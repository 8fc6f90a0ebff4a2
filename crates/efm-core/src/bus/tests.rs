//! Bus routing, priority, dedup, and delivery-guarantee tests.

use std::sync::Arc;

use super::*;
use crate::audit::MemoryAuditBackend;
use crate::capsule::GenesisRecord;
use crate::crypto::{ContentHash, ContentHasher, Signer};
use crate::governor::PriorityTier;
use crate::registry::CapsuleSlot;
use crate::sandbox::{SandboxConfig, SandboxLevel};
use crate::tether::TetherTable;

struct Fixture {
    vault: Arc<Vault>,
    registry: Arc<CapsuleRegistry>,
    chain: Arc<AuditChain>,
    root_signer: Signer,
}

fn fixture() -> Fixture {
    let root_signer = Signer::generate();
    Fixture {
        vault: Arc::new(Vault::new(root_signer.public_key())),
        registry: Arc::new(CapsuleRegistry::new()),
        chain: Arc::new(AuditChain::new(Arc::new(MemoryAuditBackend::new()), None).unwrap()),
        root_signer,
    }
}

fn bus(fx: &Fixture, sandbox: Option<Arc<SandboxEnforcer>>) -> MessageBus {
    MessageBus::new(
        fx.vault.clone(),
        fx.registry.clone(),
        fx.chain.clone(),
        sandbox,
        BusConfig::default(),
    )
}

fn register(fx: &Fixture) -> (CapsuleId, Signer, ContentHash) {
    let id = CapsuleId::generate();
    let signer = Signer::generate();
    let genesis = GenesisRecord::create(
        id,
        None,
        Tick::ZERO,
        0,
        ContentHasher::hash("efm.task.v1", b"task"),
        fx.vault.commandment_hash(),
        &fx.root_signer,
    );
    let genesis_hash = fx.vault.register(genesis, signer.public_key()).unwrap();
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
    (id, signer, genesis_hash)
}

fn send(
    sender: CapsuleId,
    signer: &Signer,
    genesis: ContentHash,
    recipient: Recipient,
    priority: u8,
    guarantee: DeliveryGuarantee,
) -> Message {
    Message::create(
        sender,
        recipient,
        "status",
        b"payload".to_vec(),
        Tick::new(1),
        8,
        priority,
        genesis,
        guarantee,
        signer,
    )
}

#[test]
fn unicast_delivers_to_recipient_mailbox() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, alice_signer, alice_genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    let message = send(
        alice,
        &alice_signer,
        alice_genesis,
        Recipient::Capsule(bob),
        5,
        DeliveryGuarantee::BestEffort,
    );
    let outcome = bus.submit(message.clone(), Tick::new(1)).unwrap();
    assert_eq!(outcome, RouteOutcome::Routed { copies: 1 });

    let delivered = bus.next_for(bob, Tick::new(2)).unwrap();
    assert_eq!(delivered.id, message.id);
    assert!(bus.next_for(bob, Tick::new(2)).is_none());
}

#[test]
fn higher_priority_dequeues_first() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    let low = send(alice, &signer, genesis, Recipient::Capsule(bob), 1, DeliveryGuarantee::BestEffort);
    let high = send(alice, &signer, genesis, Recipient::Capsule(bob), 9, DeliveryGuarantee::BestEffort);
    bus.submit(low.clone(), Tick::new(1)).unwrap();
    bus.submit(high.clone(), Tick::new(1)).unwrap();

    assert_eq!(bus.next_for(bob, Tick::new(2)).unwrap().id, high.id);
    assert_eq!(bus.next_for(bob, Tick::new(2)).unwrap().id, low.id);
}

#[test]
fn fifo_order_within_sender_recipient_priority() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    let first = send(alice, &signer, genesis, Recipient::Capsule(bob), 5, DeliveryGuarantee::AtLeastOnce);
    let second = send(alice, &signer, genesis, Recipient::Capsule(bob), 5, DeliveryGuarantee::AtLeastOnce);
    bus.submit(first.clone(), Tick::new(1)).unwrap();
    bus.submit(second.clone(), Tick::new(1)).unwrap();

    assert_eq!(bus.next_for(bob, Tick::new(2)).unwrap().id, first.id);
    assert_eq!(bus.next_for(bob, Tick::new(2)).unwrap().id, second.id);
}

#[test]
fn broadcast_fans_out_to_active_capsules() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);
    let (carol, _, _) = register(&fx);
    let (dave, _, _) = register(&fx);
    fx.registry.set_status(dave, CapsuleStatus::Terminated).unwrap();

    let message = send(alice, &signer, genesis, Recipient::Broadcast, 5, DeliveryGuarantee::BestEffort);
    let outcome = bus.submit(message.clone(), Tick::new(1)).unwrap();
    assert_eq!(outcome, RouteOutcome::Routed { copies: 2 });

    let to_bob = bus.next_for(bob, Tick::new(2)).unwrap();
    assert_eq!(to_bob.ttl, message.ttl - 1);
    assert_eq!(to_bob.hop_count, 1);
    assert!(bus.next_for(carol, Tick::new(2)).is_some());
    assert!(bus.next_for(dave, Tick::new(2)).is_none());
    assert!(bus.next_for(alice, Tick::new(2)).is_none());
}

#[test]
fn bad_signature_and_genesis_rejected() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    let impostor = Signer::generate();
    let forged = send(alice, &impostor, genesis, Recipient::Capsule(bob), 5, DeliveryGuarantee::BestEffort);
    assert_eq!(
        bus.submit(forged, Tick::new(1)).unwrap(),
        RouteOutcome::Rejected {
            reason: RouteRejection::InvalidSignature
        }
    );

    let wrong_genesis = send(
        alice,
        &signer,
        ContentHasher::hash("efm.genesis.v1", b"wrong"),
        Recipient::Capsule(bob),
        5,
        DeliveryGuarantee::BestEffort,
    );
    assert_eq!(
        bus.submit(wrong_genesis, Tick::new(1)).unwrap(),
        RouteOutcome::Rejected {
            reason: RouteRejection::GenesisMismatch
        }
    );

    let unknown = Signer::generate();
    let ghost = send(
        CapsuleId::generate(),
        &unknown,
        genesis,
        Recipient::Capsule(bob),
        5,
        DeliveryGuarantee::BestEffort,
    );
    assert_eq!(
        bus.submit(ghost, Tick::new(1)).unwrap(),
        RouteOutcome::Rejected {
            reason: RouteRejection::UnknownSender
        }
    );
}

#[test]
fn duplicate_id_rejected_within_window() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    let message = send(alice, &signer, genesis, Recipient::Capsule(bob), 5, DeliveryGuarantee::BestEffort);
    bus.submit(message.clone(), Tick::new(1)).unwrap();

    assert_eq!(
        bus.submit(message, Tick::new(5)).unwrap(),
        RouteOutcome::Rejected {
            reason: RouteRejection::Duplicate
        }
    );
}

#[test]
fn expired_ttl_rejected() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    let mut message = send(alice, &signer, genesis, Recipient::Capsule(bob), 5, DeliveryGuarantee::BestEffort);
    message.ttl = 0;
    assert_eq!(
        bus.submit(message, Tick::new(1)).unwrap(),
        RouteOutcome::Rejected {
            reason: RouteRejection::Expired
        }
    );
}

#[test]
fn unroutable_unicast_goes_to_dead_letter_queue() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);

    let message = send(
        alice,
        &signer,
        genesis,
        Recipient::Capsule(CapsuleId::generate()),
        5,
        DeliveryGuarantee::BestEffort,
    );
    let outcome = bus.submit(message, Tick::new(1)).unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::DeadLettered {
            reason: DeadLetterReason::Unroutable
        }
    );
    assert_eq!(bus.dead_letters().len(), 1);
    assert_eq!(
        fx.chain.query_kind(EventKind::MessageDeadLetter, 10).unwrap().len(),
        1
    );
}

#[test]
fn at_least_once_retries_until_ack() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    let message = send(alice, &signer, genesis, Recipient::Capsule(bob), 5, DeliveryGuarantee::AtLeastOnce);
    bus.submit(message.clone(), Tick::new(1)).unwrap();

    // First delivery; no ack.
    assert!(bus.next_for(bob, Tick::new(2)).is_some());
    assert_eq!(bus.mailbox_depth(bob), 0);

    // Backoff (base 10) elapses: the message is redelivered.
    let retried = bus.retry_sweep(Tick::new(20)).unwrap();
    assert_eq!(retried, 1);
    assert_eq!(bus.mailbox_depth(bob), 1);

    let redelivered = bus.next_for(bob, Tick::new(21)).unwrap();
    assert_eq!(redelivered.id, message.id);

    // Ack ends the cycle.
    bus.ack(message.id);
    assert_eq!(bus.retry_sweep(Tick::new(1_000)).unwrap(), 0);
}

#[test]
fn exhausted_retries_dead_letter() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    let message = send(alice, &signer, genesis, Recipient::Capsule(bob), 5, DeliveryGuarantee::AtLeastOnce);
    bus.submit(message.clone(), Tick::new(1)).unwrap();
    let _ = bus.next_for(bob, Tick::new(2));

    let mut now = 2u64;
    for _ in 0..=BusConfig::default().max_retries {
        now += 10_000;
        bus.retry_sweep(Tick::new(now)).unwrap();
        while bus.next_for(bob, Tick::new(now)).is_some() {}
    }

    assert!(bus
        .dead_letters()
        .iter()
        .any(|(m, reason)| m.id == message.id && *reason == DeadLetterReason::RetriesExhausted));
}

#[test]
fn exactly_once_receiver_drops_duplicate_delivery() {
    let fx = fixture();
    let bus = bus(&fx, None);
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    let message = send(alice, &signer, genesis, Recipient::Capsule(bob), 5, DeliveryGuarantee::ExactlyOnce);
    bus.submit(message.clone(), Tick::new(1)).unwrap();

    assert!(bus.next_for(bob, Tick::new(2)).is_some());

    // The unacked message is redelivered to the mailbox, but the receiver
    // dedup window swallows it.
    bus.retry_sweep(Tick::new(50)).unwrap();
    assert_eq!(bus.mailbox_depth(bob), 1);
    assert!(bus.next_for(bob, Tick::new(51)).is_none());
}

#[test]
fn sandboxed_sender_is_intercepted() {
    let fx = fixture();
    let sandbox = Arc::new(SandboxEnforcer::new(fx.chain.clone(), SandboxConfig::default()));
    let bus = bus(&fx, Some(sandbox.clone()));
    let (alice, signer, genesis) = register(&fx);
    let (bob, _, _) = register(&fx);

    sandbox.admit(alice, SandboxLevel::Restricted, Tick::new(1)).unwrap();

    let message = send(alice, &signer, genesis, Recipient::Capsule(bob), 5, DeliveryGuarantee::BestEffort);
    assert_eq!(
        bus.submit(message, Tick::new(2)).unwrap(),
        RouteOutcome::Rejected {
            reason: RouteRejection::SandboxBlocked
        }
    );
}
