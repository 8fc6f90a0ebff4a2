//! efm-daemon - EFM runtime host.
//!
//! Loads the configuration, assembles the runtime, bootstraps the root
//! capsule, spawns the background actors, and runs until an operator
//! shutdown or a fatal condition. Exit codes: 0 normal, 10 halted by
//! override, 20 invariant violation, 30 audit-chain corruption, 40
//! configuration invalid.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use efm_core::audit::VerifyOutcome;
use efm_core::config::RuntimeConfig;
use efm_daemon::exit::{
    EXIT_AUDIT_CORRUPT, EXIT_CONFIG_INVALID, EXIT_HALTED, EXIT_INVARIANT, EXIT_OK,
};
use efm_daemon::runtime::Runtime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// efm daemon - capsule governance runtime
#[derive(Parser, Debug)]
#[command(name = "efm-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the runtime configuration file
    #[arg(short, long, default_value = "efm.toml")]
    config: PathBuf,

    /// Wall-clock milliseconds per logical tick (overrides the config)
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Task justification for the bootstrap root capsule
    #[arg(long, default_value = "root governance")]
    root_task: String,

    /// Verify the audit chain and exit
    #[arg(long)]
    verify_audit: bool,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            return ExitCode::from(EXIT_CONFIG_INVALID as u8);
        },
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime construction cannot fail with valid defaults");

    let code = runtime.block_on(run(args, config));
    ExitCode::from(code as u8)
}

fn load_config(path: &PathBuf) -> anyhow::Result<RuntimeConfig> {
    if path.exists() {
        RuntimeConfig::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        info!(path = %path.display(), "no config file; using defaults");
        Ok(RuntimeConfig::default())
    }
}

async fn run(args: Args, config: RuntimeConfig) -> i32 {
    let runtime = match Runtime::new(config) {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!(error = %e, "runtime construction failed");
            return EXIT_CONFIG_INVALID;
        },
    };

    if args.verify_audit {
        return match runtime.verify_audit_chain() {
            Ok(VerifyOutcome::Ok) => {
                info!("audit chain verified clean");
                EXIT_OK
            },
            Ok(VerifyOutcome::FirstBreakAt(seq)) => {
                error!(seq, "audit chain corruption detected");
                EXIT_AUDIT_CORRUPT
            },
            Err(e) => {
                error!(error = %e, "audit verification failed");
                EXIT_AUDIT_CORRUPT
            },
        };
    }

    if let Err(e) = runtime.bootstrap_root(&args.root_task) {
        error!(error = %e, "root bootstrap failed");
        return EXIT_INVARIANT;
    }

    let tick_interval = args
        .tick_ms
        .map_or(runtime.config().host.tick_interval, |ms| {
            Duration::from_millis(ms.max(1))
        });
    let _override_handle = runtime.clone().spawn_actors(tick_interval);
    info!(?tick_interval, "efm runtime started");

    let run_state = runtime.run_state();
    let mut poll = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; shutting down");
                break;
            }
            _ = poll.tick() => {
                if run_state.is_shutting_down() {
                    info!("operator shutdown committed");
                    break;
                }
            }
        }
    }

    // Fatal paths terminate only after the audit chain is consistent.
    match runtime.verify_audit_chain() {
        Ok(VerifyOutcome::Ok) => {
            if run_state.is_halted() {
                EXIT_HALTED
            } else {
                EXIT_OK
            }
        },
        Ok(VerifyOutcome::FirstBreakAt(seq)) => {
            error!(seq, "audit chain corruption detected during shutdown");
            EXIT_AUDIT_CORRUPT
        },
        Err(e) => {
            error!(error = %e, "audit verification failed during shutdown");
            EXIT_AUDIT_CORRUPT
        },
    }
}
