//! Runtime construction and the scheduling loop.
//!
//! The daemon runs a fixed set of logical actors over the shared stores:
//!
//! 1. the single-writer audit committer (bounded channel, dedicated task)
//! 2. the pipeline worker pool (callers of [`Runtime::submit_request`])
//! 3. the liveness sweeper, driven by the tick loop
//! 4. the stress monitor, recomputed every tick
//! 5. the message router sweeps (retries, dead letters)
//! 6. the dedicated override worker, which nothing may block
//!
//! Registry, vault, and audit chain are the only shared mutable stores;
//! everything else is copy-on-write snapshots or per-capsule slots.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use efm_core::audit::{
    AuditChain, AuditError, AuditEvent, AuditHandle, AuditWriter, EventKind, MemoryAuditBackend,
    SqliteAuditBackend, VerifyOutcome, spawn_committer,
};
use efm_core::bus::{BusError, Message, MessageBus, RouteOutcome};
use efm_core::capsule::CapsuleId;
use efm_core::clock::{Tick, TickSource};
use efm_core::config::RuntimeConfig;
use efm_core::crypto::{ContentHasher, Keyring, ROOT_AUTHORITY, Signer};
use efm_core::gardener::{Gardener, GardenerError, GardenerRequest, GardenerResponse, RunState};
use efm_core::governor::ResourceGovernor;
use efm_core::judicial::{
    DEFAULT_WINDOW, PrecedentBook, RECOMPUTE_INTERVAL_TICKS, SciComputer, Tribunal,
};
use efm_core::liveness::{
    LivenessError, LivenessMonitor, Pulse, PulseOutcome, SpawnError, SpawnGovernor, SpawnOutcome,
    SpawnRequest,
};
use efm_core::pipeline::{
    MotifLibrary, Pipeline, PipelineOutcome, PipelineSnapshot, PolicyOracle, ReasoningOracle,
    Request,
};
use efm_core::registry::CapsuleRegistry;
use efm_core::sandbox::{SandboxEnforcer, SandboxError};
use efm_core::stress::{StressInputs, StressMonitor, StressSample};
use efm_core::tether::TetherManager;
use efm_core::vault::Vault;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors from runtime operation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The pipeline is halted by an operator override.
    #[error("runtime is halted")]
    Halted,

    /// Audit failure (backpressure or storage).
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Liveness bookkeeping failure.
    #[error(transparent)]
    Liveness(#[from] LivenessError),

    /// Spawn processing failure.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Sandbox enforcement failure.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Bus failure.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The override worker has stopped.
    #[error("override channel closed")]
    OverrideChannelClosed,
}

/// Fixed-point scale for the ambient resource pressure atomic.
const PRESSURE_SCALE: f64 = 1_000_000.0;

/// The assembled runtime.
pub struct Runtime {
    config: RuntimeConfig,
    clock: TickSource,
    vault: Arc<Vault>,
    registry: Arc<CapsuleRegistry>,
    chain: Arc<AuditChain>,
    audit: AuditHandle,
    stress: Arc<StressMonitor>,
    tethers: Arc<TetherManager>,
    governor: Arc<ResourceGovernor>,
    liveness: Arc<LivenessMonitor>,
    spawner: Arc<SpawnGovernor>,
    sandbox: Arc<SandboxEnforcer>,
    bus: Arc<MessageBus>,
    sci: Arc<SciComputer>,
    tribunal: Arc<Tribunal>,
    precedents: Arc<PrecedentBook>,
    motifs: Arc<MotifLibrary>,
    pipeline: Arc<Pipeline>,
    gardener: Arc<Gardener>,
    run_state: Arc<RunState>,
    keys: Arc<Keyring>,
    resource_pressure: AtomicU64,
    last_sci_tick: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Builds a runtime from configuration with the default oracle.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit backend cannot be opened.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_oracle(config, Arc::new(PolicyOracle))
    }

    /// Builds a runtime with a custom deliberation oracle.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit backend cannot be opened.
    #[allow(clippy::too_many_lines)]
    pub fn with_oracle(
        config: RuntimeConfig,
        oracle: Arc<dyn ReasoningOracle>,
    ) -> Result<Self, RuntimeError> {
        let clock = TickSource::new();
        let keys = Arc::new(Keyring::in_memory());

        let root_signer = keys.issue(ROOT_AUTHORITY).map_err(SpawnError::Keys)?;
        let vault = Arc::new(Vault::new(root_signer.public_key()));

        let backend: Arc<dyn efm_core::audit::AuditBackend> = match &config.audit.db_path {
            Some(path) => Arc::new(SqliteAuditBackend::open(path)?),
            None => Arc::new(MemoryAuditBackend::new()),
        };
        let chain = Arc::new(AuditChain::new(backend, Some(Signer::generate()))?);

        let mut tasks = Vec::new();
        let (audit, committer_task) = spawn_committer(
            chain.clone(),
            config.audit.durability,
            config.audit.queue_capacity,
        );
        tasks.push(committer_task);

        let registry = Arc::new(CapsuleRegistry::new());
        let stress = Arc::new(StressMonitor::new(
            config.stress.weights,
            config.stress.thresholds,
        ));
        let tethers = Arc::new(TetherManager::new(config.tethers));
        let governor = Arc::new(ResourceGovernor::new(
            config.governor.baseline,
            config.governor.allocation,
            config.circuit_breakers,
        ));
        let liveness = Arc::new(LivenessMonitor::new(
            vault.clone(),
            registry.clone(),
            chain.clone(),
            config.pulse,
        ));
        let spawner = Arc::new(SpawnGovernor::new(
            vault.clone(),
            registry.clone(),
            governor.clone(),
            keys.clone(),
            chain.clone(),
            config.spawn,
        ));
        let sandbox = Arc::new(SandboxEnforcer::new(chain.clone(), config.sandbox));
        let bus = Arc::new(MessageBus::new(
            vault.clone(),
            registry.clone(),
            chain.clone(),
            Some(sandbox.clone()),
            config.bus,
        ));
        let sci = Arc::new(SciComputer::new(config.judicial.sci_weights, DEFAULT_WINDOW));
        let tribunal = Arc::new(Tribunal::new(config.judicial.tribunal));
        let precedents = Arc::new(PrecedentBook::new());
        let motifs = Arc::new(config.motifs.clone());
        let pipeline = Arc::new(Pipeline::new(
            config.pipeline.budgets,
            config.pipeline_thresholds(),
            oracle,
            audit.clone(),
        ));
        let run_state = Arc::new(RunState::new());
        let gardener = Arc::new(Gardener::new(
            vault.clone(),
            registry.clone(),
            chain.clone(),
            run_state.clone(),
            config.override_channel.latency_budget_ms,
        ));

        Ok(Self {
            config,
            clock,
            vault,
            registry,
            chain,
            audit,
            stress,
            tethers,
            governor,
            liveness,
            spawner,
            sandbox,
            bus,
            sci,
            tribunal,
            precedents,
            motifs,
            pipeline,
            gardener,
            run_state,
            keys,
            resource_pressure: AtomicU64::new(0),
            last_sci_tick: AtomicU64::new(0),
            tasks,
        })
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The logical clock.
    #[must_use]
    pub const fn clock(&self) -> &TickSource {
        &self.clock
    }

    /// The vault.
    #[must_use]
    pub fn vault(&self) -> Arc<Vault> {
        self.vault.clone()
    }

    /// The registry.
    #[must_use]
    pub fn registry(&self) -> Arc<CapsuleRegistry> {
        self.registry.clone()
    }

    /// The audit chain (read side).
    #[must_use]
    pub fn chain(&self) -> Arc<AuditChain> {
        self.chain.clone()
    }

    /// The committer-backed audit submitter.
    #[must_use]
    pub fn audit_handle(&self) -> AuditHandle {
        self.audit.clone()
    }

    /// The sandbox enforcer.
    #[must_use]
    pub fn sandbox(&self) -> Arc<SandboxEnforcer> {
        self.sandbox.clone()
    }

    /// The message bus.
    #[must_use]
    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    /// The precedent book.
    #[must_use]
    pub fn precedents(&self) -> Arc<PrecedentBook> {
        self.precedents.clone()
    }

    /// The conflict tribunal.
    #[must_use]
    pub fn tribunal(&self) -> Arc<Tribunal> {
        self.tribunal.clone()
    }

    /// The gardener interface.
    #[must_use]
    pub fn gardener(&self) -> Arc<Gardener> {
        self.gardener.clone()
    }

    /// The process run state.
    #[must_use]
    pub fn run_state(&self) -> Arc<RunState> {
        self.run_state.clone()
    }

    /// The keyring.
    #[must_use]
    pub fn keys(&self) -> Arc<Keyring> {
        self.keys.clone()
    }

    /// The spawn governor.
    #[must_use]
    pub fn spawner(&self) -> Arc<SpawnGovernor> {
        self.spawner.clone()
    }

    /// Registers the root capsule (lineage depth 0) at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn bootstrap_root(&self, justification: &str) -> Result<CapsuleId, RuntimeError> {
        let now = self.clock.now();
        let root_signer = self
            .keys
            .signer(ROOT_AUTHORITY)
            .map_err(SpawnError::Keys)?;

        let id = CapsuleId::generate();
        let capsule_signer = self
            .keys
            .issue(&id.as_string())
            .map_err(SpawnError::Keys)?;

        let genesis = efm_core::capsule::GenesisRecord::create(
            id,
            None,
            now,
            0,
            ContentHasher::hash("efm.task.v1", justification.as_bytes()),
            self.vault.commandment_hash(),
            &root_signer,
        );
        let genesis_hash = self
            .vault
            .register(genesis, capsule_signer.public_key())
            .map_err(SpawnError::Vault)?;

        self.registry
            .insert(efm_core::registry::CapsuleSlot::new(
                id,
                None,
                0,
                genesis_hash,
                now,
                efm_core::governor::PriorityTier::Critical,
                self.tethers.vector_for(self.stress.current().level),
            ))
            .map_err(SpawnError::Registry)?;

        self.chain.append(AuditEvent::new(
            EventKind::CapsuleGenesis,
            now,
            AuditWriter::system("bootstrap"),
            Some(id),
            &json!({ "lineage_depth": 0, "genesis_hash": genesis_hash.to_string() }),
        ))?;

        info!(capsule = %id, "root capsule bootstrapped");
        Ok(id)
    }

    /// Sets the ambient resource pressure observed by the stress monitor.
    pub fn set_resource_pressure(&self, pressure: f64) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let fixed = (pressure.clamp(0.0, 1.0) * PRESSURE_SCALE) as u64;
        self.resource_pressure.store(fixed, Ordering::Release);
    }

    fn ambient_resource_pressure(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let fixed = self.resource_pressure.load(Ordering::Acquire) as f64;
        fixed / PRESSURE_SCALE
    }

    /// Advances the logical clock one tick and runs every per-tick duty:
    /// liveness sweep, first-pulse rollback, sandbox exit rules, bus retry
    /// sweep, SCI recomputation, and the stress-to-tether reaction.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures.
    pub fn tick(&self) -> Result<Tick, RuntimeError> {
        let now = self.clock.advance();

        self.liveness.sweep(now)?;
        self.spawner.check_first_pulses(now)?;
        self.sandbox.apply_exit_rules(now)?;
        self.bus.retry_sweep(now)?;

        // SCI recomputes on its own cadence.
        let last_sci = self.last_sci_tick.load(Ordering::Acquire);
        if now.value().saturating_sub(last_sci) >= RECOMPUTE_INTERVAL_TICKS {
            self.last_sci_tick.store(now.value(), Ordering::Release);
            let snapshot = self.registry.snapshot();
            self.sci.record_health_alignment(snapshot.mean_health());
            let sci = self.sci.compute();
            self.chain.append(AuditEvent::new(
                EventKind::SciRecomputed,
                now,
                AuditWriter::system("judicial"),
                None,
                &json!({ "sci": sci }),
            ))?;
        }

        self.react_to_stress(now)?;
        Ok(now)
    }

    // Recompute stress from registry aggregates and ambient pressure, then
    // drive tethers and breakers from the sample. Tether republication on
    // every level change keeps the 10-tick response contract.
    fn react_to_stress(&self, now: Tick) -> Result<(), RuntimeError> {
        let snapshot = self.registry.snapshot();
        self.stress.set_inputs(StressInputs {
            health_composite: snapshot.mean_health(),
            entropy: snapshot.mean_entropy(),
            resource_pressure: self.ambient_resource_pressure(),
            sci: self.sci.compute(),
        });

        let (sample, previous) = self.stress.recompute(now);

        for (breaker, now_open) in self
            .governor
            .breakers()
            .observe(sample, self.stress.thresholds())
        {
            let kind = if now_open {
                EventKind::BreakerTripped
            } else {
                EventKind::BreakerReset
            };
            self.chain.append(AuditEvent::new(
                kind,
                now,
                AuditWriter::system("governor"),
                None,
                &json!({ "breaker": breaker.to_string(), "stress": sample.value }),
            ))?;
        }

        if sample.level != previous {
            self.chain.append(AuditEvent::new(
                EventKind::StressLevelChanged,
                now,
                AuditWriter::system("stress"),
                None,
                &json!({
                    "from": previous.to_string(),
                    "to": sample.level.to_string(),
                    "value": sample.value,
                }),
            ))?;

            let updated = self.tethers.apply(sample.level, &self.registry);
            self.chain.append(AuditEvent::new(
                EventKind::TetherUpdated,
                now,
                AuditWriter::system("tether"),
                None,
                &json!({ "level": sample.level.to_string(), "capsules": updated }),
            ))?;
        }
        Ok(())
    }

    /// The current stress sample.
    #[must_use]
    pub fn stress_sample(&self) -> StressSample {
        self.stress.current()
    }

    /// Submits an external request to the decision pipeline.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Halted`] once an operator halt has committed.
    /// - [`RuntimeError::Audit`] with [`AuditError::Overloaded`] under
    ///   committer backpressure; the incident also raises stress.
    pub async fn submit_request(&self, request: &Request) -> Result<PipelineOutcome, RuntimeError> {
        if self.run_state.is_halted() {
            return Err(RuntimeError::Halted);
        }

        let snapshot = PipelineSnapshot {
            motifs: self.motifs.clone(),
            precedents: self.precedents.snapshot(),
            registry: self.registry.snapshot(),
            sci: self.sci.compute(),
            stress_level: self.stress.current().level,
            tick: self.clock.now(),
        };

        match self.pipeline.submit(request, &snapshot).await {
            Ok(outcome) => {
                let consistent = matches!(outcome, PipelineOutcome::Permit);
                self.sci
                    .record_decision_consistency(if consistent { 1.0 } else { 0.8 });
                Ok(outcome)
            },
            Err(AuditError::Overloaded) => {
                warn!("audit committer overloaded; rejecting admission");
                self.stress.inject_incident(0.2);
                Err(RuntimeError::Audit(AuditError::Overloaded))
            },
            Err(e) => Err(RuntimeError::Audit(e)),
        }
    }

    /// Submits a capsule pulse.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures; rejections are
    /// values.
    pub fn submit_pulse(&self, pulse: &Pulse) -> Result<PulseOutcome, RuntimeError> {
        Ok(self.liveness.submit_pulse(pulse, self.clock.now())?)
    }

    /// Requests a spawn on behalf of a parent capsule.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures; denials are
    /// values.
    pub fn request_spawn(&self, request: &SpawnRequest) -> Result<SpawnOutcome, RuntimeError> {
        let sample = self.stress.current();
        let tether = self.tethers.vector_for(sample.level);
        Ok(self.spawner.admit(
            request,
            self.clock.now(),
            sample.level,
            self.sci.compute(),
            tether,
        )?)
    }

    /// Routes a message through the bus.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures.
    pub fn route_message(&self, message: Message) -> Result<RouteOutcome, RuntimeError> {
        let outcome = self.bus.submit(message, self.clock.now())?;
        let delivered = matches!(outcome, RouteOutcome::Routed { .. });
        self.sci
            .record_communication_coherence(if delivered { 1.0 } else { 0.0 });
        Ok(outcome)
    }

    /// Verifies the whole audit chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails; corruption is reported as a
    /// value.
    pub fn verify_audit_chain(&self) -> Result<VerifyOutcome, RuntimeError> {
        let head = self.chain.head_seq();
        if head == 0 {
            return Ok(VerifyOutcome::Ok);
        }
        Ok(self.chain.verify_range(1, head)?)
    }

    /// Spawns the background actors: the tick loop and the override
    /// worker. Returns a handle for submitting override commands.
    #[must_use]
    pub fn spawn_actors(self: Arc<Self>, tick_interval: Duration) -> OverrideHandle {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                ticker.tick().await;
                if runtime.run_state.is_shutting_down() {
                    break;
                }
                if let Err(e) = runtime.tick() {
                    error!(error = %e, "tick loop failure");
                }
            }
        });

        // The override worker is dedicated; it never waits behind pool
        // work and nothing in the runtime can block it.
        let (tx, mut rx) = mpsc::channel::<OverrideEnvelope>(64);
        let runtime = self;
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                let result = runtime.gardener.execute(&request, runtime.clock.now());
                let _ = reply.send(result);
            }
        });

        OverrideHandle { tx }
    }

    /// Aborts the background tasks (tests and orderly shutdown).
    pub fn shutdown_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("capsules", &self.registry.len())
            .field("audit_head", &self.chain.head_seq())
            .finish_non_exhaustive()
    }
}

type OverrideEnvelope = (
    GardenerRequest,
    oneshot::Sender<Result<GardenerResponse, GardenerError>>,
);

/// Handle for the dedicated override worker.
#[derive(Clone)]
pub struct OverrideHandle {
    tx: mpsc::Sender<OverrideEnvelope>,
}

impl OverrideHandle {
    /// Executes an override command through the dedicated worker.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::OverrideChannelClosed`] if the worker is gone.
    /// - [`RuntimeError::Audit`] if the pre-execution log failed.
    pub async fn execute(&self, request: GardenerRequest) -> Result<GardenerResponse, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| RuntimeError::OverrideChannelClosed)?;
        let result = reply_rx
            .await
            .map_err(|_| RuntimeError::OverrideChannelClosed)?;
        result.map_err(|e| match e {
            GardenerError::Audit(inner) => RuntimeError::Audit(inner),
        })
    }
}

impl std::fmt::Debug for OverrideHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverrideHandle").finish()
    }
}
