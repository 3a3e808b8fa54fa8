//! vsnet simulator and device CLI
//!
//! Runs simulated replication scenarios, a live UDP device, or synthesizes
//! delay traces for recorded degradation.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;
use vsnet_core::elements::{MoCapOrientation, MoCapPose};
use vsnet_core::{DeviceRegistry, DriverConfig, ScenarioSession, SessionConfig, SessionDriver};
use vsnet_env::{NetClock, UdpConfig, UdpTransport};
use vsnet_sim::scenarios::ScenarioId;
use vsnet_sim::{LatencyExport, ScenarioResult, ScenarioRunner, TraceSynthesizer};

/// vsnet simulation and device CLI
#[derive(Parser, Debug)]
#[command(name = "vsnet-sim")]
#[command(about = "Deterministic replication scenarios and live vsnet devices", long_about = None)]
struct Args {
    /// Verbose output (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run simulated scenarios
    Run {
        /// Scenario to run (clock_sync, pose_replication, recorded_replay,
        /// poisson_burst, haptic_loopback, lossy_link, all)
        #[arg(short = 'S', long, default_value = "all")]
        scenario: String,

        /// Master seed for determinism (0 = random from time)
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Number of consecutive seeds to test
        #[arg(long, default_value = "1")]
        seeds: usize,

        /// Streaming duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: f64,

        /// Number of simulated devices
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// JSON output for CI parsing
        #[arg(long)]
        json: bool,

        /// Write applied-update latencies of a single scenario to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Run a live device over UDP, streaming one body pose
    Node {
        /// Session configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides the configured device id
        #[arg(long)]
        device_id: Option<u8>,

        /// Peer hosts to scan and subscribe to instead of broadcasting
        #[arg(long = "peer")]
        peers: Vec<IpAddr>,

        /// Seconds to run (0 = until killed)
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },

    /// Synthesize a recorded-degradation trace
    SynthTrace {
        /// Slot width in milliseconds
        #[arg(long, default_value = "20")]
        period: i32,

        /// Mean delay in milliseconds
        #[arg(long, default_value = "40")]
        base: f64,

        /// Delay standard deviation in milliseconds
        #[arg(long, default_value = "10")]
        jitter: f64,

        /// Fraction of slots dropped
        #[arg(long, default_value = "0")]
        loss: f64,

        /// Trace length in milliseconds
        #[arg(short, long, default_value = "10000")]
        duration: i32,

        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Run {
            scenario,
            seed,
            seeds,
            duration,
            nodes,
            json,
            export,
        } => {
            let failed = run_scenarios(&scenario, seed, seeds, duration, nodes, json, export)?;
            if failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Node {
            config,
            device_id,
            peers,
            duration,
        } => run_node(config, device_id, &peers, duration),
        Command::SynthTrace {
            period,
            base,
            jitter,
            loss,
            duration,
            seed,
            out,
        } => {
            let recording = TraceSynthesizer::new(period, base, jitter, loss)?
                .with_seed(seed)
                .synthesize(duration)?;
            recording
                .save(&out)
                .with_context(|| format!("writing {}", out.display()))?;
            info!(
                path = %out.display(),
                slots = recording.delay.len(),
                loss = recording.loss_ratio(),
                "trace written"
            );
            Ok(())
        }
    }
}

/// Runs the selected scenarios and returns the number of failed runs.
fn run_scenarios(
    scenario: &str,
    seed: u64,
    seeds: usize,
    duration: f64,
    nodes: usize,
    json: bool,
    export: Option<PathBuf>,
) -> Result<usize> {
    let scenarios: Vec<ScenarioId> = if scenario == "all" {
        ScenarioId::all()
    } else {
        vec![scenario.parse().map_err(anyhow::Error::msg)?]
    };
    if export.is_some() && (scenarios.len() > 1 || seeds > 1) {
        bail!("--export only supports a single scenario and seed");
    }

    let base_seed = if seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        seed
    };

    if !json {
        info!("vsnet simulator v{}", env!("CARGO_PKG_VERSION"));
    }

    let mut results: Vec<ScenarioResult> = Vec::new();
    for offset in 0..seeds.max(1) {
        let seed = base_seed.wrapping_add(offset as u64);
        let runner = ScenarioRunner::new(seed, nodes).with_duration(duration);
        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !json {
                report(&result);
            }
            results.push(result);
        }
    }

    if let (Some(path), Some(result)) = (&export, results.first()) {
        let mut latency = LatencyExport::new(result.scenario.name(), result.seed);
        latency.add_samples(result.samples.iter().copied());
        latency.finalize(result.passed);
        latency
            .write_to_file(path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), samples = latency.samples.len(), "latencies exported");
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    if json {
        let summary = serde_json::json!({
            "total": results.len(),
            "passed": results.len() - failed,
            "failed": failed,
            "results": results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "time_ms": r.final_time_ms,
                    "sync_time_ms": r.metrics.sync_time_ms,
                    "max_clock_skew_ms": r.metrics.max_clock_skew_ms,
                    "packets_sent": r.metrics.packets_sent,
                    "packets_dropped": r.metrics.packets_dropped,
                    "delay": r.metrics.delay,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if failed == 0 {
        info!("all {} scenario runs passed", results.len());
    } else {
        error!("{}/{} scenario runs failed", failed, results.len());
    }
    Ok(failed)
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED | ticks={} applied={} mean delay={:.1} ms",
            result.scenario.name(),
            result.seed,
            result.total_ticks,
            result.metrics.delay.count,
            result.metrics.delay.mean_ms
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

fn run_node(config: Option<PathBuf>, device_id: Option<u8>, peers: &[IpAddr], duration: u64) -> Result<()> {
    let mut config = match config {
        Some(path) => SessionConfig::load(&path)?,
        None => SessionConfig::default(),
    };
    if let Some(id) = device_id {
        config.init.device_id = id;
    }
    let init = config.init.clone();
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    let mut registry_config = config.registry_config();
    if !peers.is_empty() {
        registry_config.broadcast_targets = peers.iter().map(|ip| SocketAddr::new(*ip, init.registry_port)).collect();
    }

    let clock = NetClock::started();
    let registry_transport = UdpTransport::bind(UdpConfig::new(SocketAddr::new(any, init.registry_port)))
        .with_context(|| format!("binding registry port {}", init.registry_port))?;
    let session_transport = UdpTransport::bind(UdpConfig::new(SocketAddr::new(any, init.session_port)))
        .with_context(|| format!("binding session port {}", init.session_port))?;
    let registry = DeviceRegistry::new(registry_transport, clock, registry_config);
    let session = ScenarioSession::new(session_transport, registry);

    let poses = session.add_channel::<MoCapPose>(
        init.pose_channel,
        Some(Box::new(|pose| info!(id = pose.id(), "remote body appeared"))),
    )?;
    poses.qos_manager().set_configuration(&config.mocap_qos)?;
    let body = poses.add_host_element_with(
        init.body_id,
        MoCapPose {
            body_id: init.body_id,
            ..MoCapPose::default()
        },
    )?;
    let orientations = session.add_channel::<MoCapOrientation>(init.orientation_channel, None)?;
    orientations.set_qos_manager(poses.qos_manager());
    orientations.add_host_element_with(
        init.body_id,
        MoCapOrientation {
            body_id: init.body_id,
            ..MoCapOrientation::default()
        },
    )?;
    for peer in peers {
        let addr = SocketAddr::new(*peer, init.session_port);
        poses.subscribe_to(addr)?;
        orientations.subscribe_to(addr)?;
    }

    let mut driver = SessionDriver::spawn(Arc::clone(&session), DriverConfig::default())?;
    info!(device = init.device_id, addr = %session.local_addr(), "device running");

    let started = Instant::now();
    while duration == 0 || started.elapsed() < Duration::from_secs(duration) {
        std::thread::sleep(Duration::from_secs(1));
        if !driver.is_running() {
            warn!("tick thread stopped");
            break;
        }
        for device in session.registry().devices() {
            info!(
                device = device.id.0,
                addr = %device.address,
                state = ?device.sync_state,
                "known device"
            );
        }
        info!(
            ticks = driver.ticks(),
            remotes = poses.remote_elements().len() + orientations.remote_elements().len(),
            x = body.snapshot().pose.position[0],
            "status"
        );
    }

    driver.shutdown();
    session.close();
    Ok(())
}
