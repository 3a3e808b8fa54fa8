//! Scenario runner - executes replication and degradation scenarios.

use crate::error::SimError;
use crate::exporter::{DelaySummary, LatencySample};
use crate::network::LinkProfile;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use vsnet_core::elements::{HapticStimulus, HeartRateSensor, MoCapPose, Pose};
use vsnet_core::qos::{JitterModel, PoissonJitter, PoissonParams, QosStrategy};
use vsnet_core::registry::MIN_CLOCK_ACCURACY;
use vsnet_core::{Channel, ElementHandle, Recording, ScenarioElement};

const POSE_CHANNEL: u8 = 4;
const HAPTIC_COMMAND_CHANNEL: u8 = 7;
const HAPTIC_ECHO_CHANNEL: u8 = 8;
const HEART_RATE_CHANNEL: u8 = 9;

/// Longest warm-up allowed for clock synchronization.
const SYNC_LIMIT_MS: i64 = 5_000;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total session ticks executed
    pub total_ticks: u64,

    /// Final simulated time in milliseconds
    pub final_time_ms: i64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Every update applied on a replica
    pub samples: Vec<LatencySample>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Datagrams sent by all transports
    pub packets_sent: u64,

    /// Datagrams handed to a receiver
    pub packets_delivered: u64,

    /// Datagrams dropped by loss or partition
    pub packets_dropped: u64,

    /// Time until every follower was synchronized (ms)
    pub sync_time_ms: Option<i64>,

    /// Largest clock difference at the end of the run (ms)
    pub max_clock_skew_ms: i32,

    /// Effective delay of applied updates
    pub delay: DelaySummary,
}

type SampleSink = Arc<Mutex<Vec<LatencySample>>>;

/// Runs replication scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of nodes
    num_nodes: usize,

    /// Session tick period in milliseconds
    tick_ms: i64,

    /// Streaming duration in milliseconds
    duration_ms: i64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner. At least two nodes are used.
    pub fn new(seed: u64, num_nodes: usize) -> Self {
        Self {
            seed,
            num_nodes: num_nodes.max(2),
            tick_ms: 20,
            duration_ms: 10_000,
        }
    }

    /// Sets the tick period.
    pub fn with_tick_ms(mut self, tick_ms: i64) -> Self {
        self.tick_ms = tick_ms.max(1);
        self
    }

    /// Sets the streaming duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_ms = (secs.max(0.0) * 1000.0) as i64;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!(scenario = scenario.name(), seed = self.seed, "starting scenario");
        let outcome = match scenario {
            ScenarioId::ClockSync => self.run_clock_sync(),
            ScenarioId::PoseReplication => self.run_pose_replication(),
            ScenarioId::RecordedReplay => self.run_recorded_replay(),
            ScenarioId::PoissonBurst => self.run_poisson_burst(),
            ScenarioId::HapticLoopback => self.run_haptic_loopback(),
            ScenarioId::LossyLink => self.run_lossy_link(),
        };
        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(scenario = scenario.name(), error = %e, "scenario setup failed");
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_ms: 0,
                    failure_reason: Some(format!("setup failed: {e}")),
                    metrics: ScenarioMetrics::default(),
                    samples: Vec::new(),
                }
            }
        }
    }

    /// Runs every scenario.
    pub fn run_all(&self) -> Vec<ScenarioResult> {
        ScenarioId::all().into_iter().map(|s| self.run(s)).collect()
    }

    fn world(&self, num_nodes: usize, link: LinkProfile) -> Result<SimWorld, SimError> {
        SimWorld::new(SimConfig {
            seed: self.seed,
            num_nodes,
            tick_ms: self.tick_ms,
            link,
            ..SimConfig::default()
        })
    }

    fn stream_ticks(&self) -> u64 {
        (self.duration_ms / self.tick_ms).max(1) as u64
    }

    /// Clock sync: random offsets, verify every follower ends within accuracy.
    fn run_clock_sync(&self) -> Result<ScenarioResult, SimError> {
        let mut world = self.world(self.num_nodes, LinkProfile::new(2.0, 0.5, 0.0))?;
        let initial_skew = world.max_clock_skew();
        let sync_time = world.run_until_synchronized(SYNC_LIMIT_MS);
        world.step(self.duration_ms.min(2_000));

        let skew = world.max_clock_skew();
        debug!(initial_skew, skew, ?sync_time, "clock sync finished");
        let failure = if sync_time.is_none() || !world.all_synchronized() {
            Some(format!("followers not synchronized after {SYNC_LIMIT_MS} ms"))
        } else if skew > MIN_CLOCK_ACCURACY {
            Some(format!("clock skew {skew} ms exceeds {MIN_CLOCK_ACCURACY} ms"))
        } else {
            None
        };
        Ok(self.finish(ScenarioId::ClockSync, &world, sync_time, Vec::new(), failure))
    }

    /// Pose replication: node 0 streams a moving body, every other node follows it.
    fn run_pose_replication(&self) -> Result<ScenarioResult, SimError> {
        let mut world = self.world(self.num_nodes, LinkProfile::new(3.0, 1.0, 0.0))?;
        let sync_time = world.run_until_synchronized(SYNC_LIMIT_MS);
        let sink = SampleSink::default();
        let (host, followers) = setup_pose_stream(&world, &sink)?;

        let ticks = self.stream_ticks();
        for _ in 0..ticks {
            move_body(&host, &world);
            world.step(self.tick_ms);
        }

        let samples = take(&sink);
        let failure = check_followers(&host, &followers, 0.2).or_else(|| {
            let expected = ticks as usize * followers.len();
            (samples.len() * 10 < expected * 8)
                .then(|| format!("only {} of ~{expected} updates applied", samples.len()))
        });
        Ok(self.finish(ScenarioId::PoseReplication, &world, sync_time, samples, failure))
    }

    /// Recorded replay: the same trace gives the same applied times, every time.
    fn run_recorded_replay(&self) -> Result<ScenarioResult, SimError> {
        let recording = Recording::new(20, vec![0, 5, 0, 10]);
        let (world, sync_time, first, origin) = self.replay_once(&recording)?;
        let (_, _, second, _) = self.replay_once(&recording)?;

        let mut timed = recording.clone();
        timed.set_time_origin(origin);
        let failure = if first.is_empty() {
            Some("no updates applied".to_string())
        } else if first != second {
            Some("replays differ".to_string())
        } else {
            first
                .iter()
                .find(|s| s.delay() < timed.get_delay(s.timestamp))
                .map(|s| format!("update {} applied after {} ms, trace says {}", s.timestamp, s.delay(), timed.get_delay(s.timestamp)))
        };
        Ok(self.finish(ScenarioId::RecordedReplay, &world, sync_time, first, failure))
    }

    fn replay_once(&self, recording: &Recording) -> Result<(SimWorld, Option<i64>, Vec<LatencySample>, i32), SimError> {
        let mut world = self.world(2, LinkProfile::new(1.0, 0.0, 0.0))?;
        let sync_time = world.run_until_synchronized(SYNC_LIMIT_MS);
        let sink = SampleSink::default();
        let (host, followers) = setup_pose_stream(&world, &sink)?;

        let mut origin = 0;
        for channel in &followers {
            let qos = channel.qos_manager();
            qos.set_recorded_degradation(recording.clone());
            qos.reset_recording();
            if let QosStrategy::Recorded(active) = qos.strategy() {
                origin = active.time_origin();
            }
        }

        for _ in 0..self.stream_ticks() {
            move_body(&host, &world);
            world.step(self.tick_ms);
        }
        let samples = take(&sink);
        world.shutdown();
        Ok((world, sync_time, samples, origin))
    }

    /// Poisson burst: released in order, never more than the table size per tick.
    fn run_poisson_burst(&self) -> Result<ScenarioResult, SimError> {
        let mut world = self.world(2, LinkProfile::new(2.0, 0.0, 0.0))?;
        let sync_time = world.run_until_synchronized(SYNC_LIMIT_MS);
        let sink = SampleSink::default();

        let (source, sensor) = {
            let host = node(&world, 0)?;
            let follower = node(&world, 1)?;
            let source = host.session.add_channel::<HeartRateSensor>(HEART_RATE_CHANNEL, None)?;
            let sensor = source.add_host_element(0)?;
            let mirror = follower.session.add_channel::<HeartRateSensor>(HEART_RATE_CHANNEL, None)?;
            observe(&mirror, 1, &sink);
            let params = PoissonParams {
                seed: Some(self.seed),
                ..PoissonParams::default()
            };
            mirror
                .qos_manager()
                .set_random_degradation(JitterModel::Poisson(PoissonJitter::new(params)?));
            mirror.subscribe_to(host.session_addr())?;
            (source, sensor)
        };

        let mut raw = 0u32;
        for _ in 0..self.stream_ticks() {
            raw = raw.wrapping_add(7);
            sensor.with(|s| s.raw_measurement_1 = raw);
            world.step(self.tick_ms);
        }
        source.destroy_host_element(sensor.id());
        world.step(2_000);

        let samples = take(&sink);
        let mirror = node(&world, 1)?
            .session
            .try_get_channel::<HeartRateSensor>(HEART_RATE_CHANNEL)
            .ok_or(SimError::invalid("channel", f64::from(HEART_RATE_CHANNEL)))?;
        let mut per_tick: BTreeMap<i32, usize> = BTreeMap::new();
        for sample in &samples {
            *per_tick.entry(sample.applied_at).or_default() += 1;
        }
        let burst = per_tick.values().copied().max().unwrap_or(0);

        let failure = if samples.is_empty() {
            Some("no updates applied".to_string())
        } else if samples.windows(2).any(|w| w[0].timestamp >= w[1].timestamp) {
            Some("updates applied out of order".to_string())
        } else if burst >= PoissonParams::DEFAULT_BUFFER_SIZE {
            Some(format!("{burst} updates released in one tick"))
        } else if mirror.pending_updates(sensor.id()).unwrap_or(0) > 0 {
            Some("backlog not drained".to_string())
        } else {
            None
        };
        debug!(burst, applied = samples.len(), "poisson burst finished");
        Ok(self.finish(ScenarioId::PoissonBurst, &world, sync_time, samples, failure))
    }

    /// Haptic loopback: node 1 echoes node 0's amplitude back on another channel.
    fn run_haptic_loopback(&self) -> Result<ScenarioResult, SimError> {
        let mut world = self.world(2, LinkProfile::new(3.0, 0.5, 0.0))?;
        let sync_time = world.run_until_synchronized(SYNC_LIMIT_MS);
        let sink = SampleSink::default();

        let (command, echo_at_follower, commands_at_follower, echoes_at_host) = {
            let host = node(&world, 0)?;
            let follower = node(&world, 1)?;
            let commands = host.session.add_channel::<HapticStimulus>(HAPTIC_COMMAND_CHANNEL, None)?;
            let echoes_at_host = host.session.add_channel::<HapticStimulus>(HAPTIC_ECHO_CHANNEL, None)?;
            let commands_at_follower = follower.session.add_channel::<HapticStimulus>(HAPTIC_COMMAND_CHANNEL, None)?;
            let echoes = follower.session.add_channel::<HapticStimulus>(HAPTIC_ECHO_CHANNEL, None)?;
            observe(&echoes_at_host, 0, &sink);

            let command = commands.add_host_element(0)?;
            let echo = echoes.add_host_element(0)?;
            commands_at_follower.subscribe_to(host.session_addr())?;
            echoes_at_host.subscribe_to(follower.session_addr())?;
            (command, echo, commands_at_follower, echoes_at_host)
        };
        world.step(self.tick_ms);

        const PATTERN: [u8; 4] = [200, HapticStimulus::REST, 60, 255];
        let change_every = (500 / self.tick_ms).max(1) as u64;
        let mut outstanding: Option<(u8, i64)> = None;
        let mut round_trips = Vec::new();
        let mut missed = 0;

        for tick in 0..self.stream_ticks() {
            if let Some(remote) = commands_at_follower.remote_elements().first() {
                let amplitude = remote.lock().amplitude();
                echo_at_follower.with(|e| e.set_amplitude(amplitude));
            }
            if let Some((target, since)) = outstanding {
                let echoed = echoes_at_host
                    .remote_elements()
                    .first()
                    .is_some_and(|e| e.lock().amplitude() == target);
                if echoed {
                    round_trips.push(world.elapsed_ms() - since);
                    outstanding = None;
                }
            }
            if tick % change_every == 0 {
                if outstanding.is_some() {
                    missed += 1;
                }
                let target = PATTERN[(tick / change_every) as usize % PATTERN.len()];
                command.with(|c| c.set_amplitude(target));
                outstanding = Some((target, world.elapsed_ms()));
            }
            world.step(self.tick_ms);
        }

        let slowest = round_trips.iter().copied().max().unwrap_or(0);
        debug!(changes = round_trips.len(), slowest, missed, "haptic loopback finished");
        let failure = if round_trips.is_empty() {
            Some("no change echoed".to_string())
        } else if missed > 0 {
            Some(format!("{missed} changes never echoed"))
        } else if slowest > 200 {
            Some(format!("slowest echo took {slowest} ms"))
        } else {
            None
        };
        Ok(self.finish(ScenarioId::HapticLoopback, &world, sync_time, take(&sink), failure))
    }

    /// Lossy link: clocks sync on a clean link, then 30% loss while streaming.
    fn run_lossy_link(&self) -> Result<ScenarioResult, SimError> {
        const LOSS: f64 = 0.3;
        let mut world = self.world(2, LinkProfile::new(3.0, 1.0, 0.0))?;
        let sync_time = world.run_until_synchronized(SYNC_LIMIT_MS);
        let sink = SampleSink::default();
        let (host, followers) = setup_pose_stream(&world, &sink)?;
        world.controller.set_default_profile(LinkProfile::new(3.0, 1.0, LOSS));

        let ticks = self.stream_ticks();
        for _ in 0..ticks {
            move_body(&host, &world);
            world.step(self.tick_ms);
        }

        let samples = take(&sink);
        let ratio = samples.len() as f64 / ticks as f64;
        let failure = if world.controller.lost_count() == 0 {
            Some("no datagram lost".to_string())
        } else {
            check_followers(&host, &followers, 0.3).or_else(|| {
                (ratio < 1.0 - LOSS - 0.15 || ratio > 1.0 - LOSS + 0.15)
                    .then(|| format!("applied ratio {ratio:.2} far from {:.2}", 1.0 - LOSS))
            })
        };
        Ok(self.finish(ScenarioId::LossyLink, &world, sync_time, samples, failure))
    }

    fn finish(
        &self,
        scenario: ScenarioId,
        world: &SimWorld,
        sync_time: Option<i64>,
        samples: Vec<LatencySample>,
        failure: Option<String>,
    ) -> ScenarioResult {
        let metrics = ScenarioMetrics {
            packets_sent: world.packets_sent(),
            packets_delivered: world.network.delivered_count(),
            packets_dropped: world.network.dropped_count(),
            sync_time_ms: sync_time,
            max_clock_skew_ms: world.max_clock_skew(),
            delay: DelaySummary::of(&samples),
        };
        if let Some(reason) = &failure {
            warn!(scenario = scenario.name(), seed = self.seed, reason = %reason, "scenario failed");
        }
        world.shutdown();
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure.is_none(),
            total_ticks: world.tick_count(),
            final_time_ms: world.elapsed_ms(),
            failure_reason: failure,
            metrics,
            samples,
        }
    }
}

fn node(world: &SimWorld, index: usize) -> Result<&crate::world::SimNode, SimError> {
    world.node(index).ok_or(SimError::invalid("node index", index as f64))
}

/// Node 0 hosts a body on the pose channel; every other node subscribes.
fn setup_pose_stream(
    world: &SimWorld,
    sink: &SampleSink,
) -> Result<(ElementHandle<MoCapPose>, Vec<Arc<Channel<MoCapPose>>>), SimError> {
    let host_node = node(world, 0)?;
    let source = host_node.session.add_channel::<MoCapPose>(POSE_CHANNEL, None)?;
    let body = source.add_host_element_with(
        1,
        MoCapPose {
            body_id: 1,
            pose: Pose::IDENTITY,
        },
    )?;

    let mut followers = Vec::new();
    for follower in world.nodes().iter().skip(1) {
        let channel = follower.session.add_channel::<MoCapPose>(POSE_CHANNEL, None)?;
        observe(&channel, follower.index, sink);
        channel.subscribe_to(host_node.session_addr())?;
        followers.push(channel);
    }
    Ok((body, followers))
}

/// Walks the body along x at 1 m/s of simulated time.
fn move_body(body: &ElementHandle<MoCapPose>, world: &SimWorld) {
    let x = world.elapsed_ms() as f32 / 1000.0;
    body.with(|b| b.pose = Pose::at(x, 1.7, 0.0));
}

/// Every follower holds a replica of `host` within `tolerance` metres.
fn check_followers(
    host: &ElementHandle<MoCapPose>,
    followers: &[Arc<Channel<MoCapPose>>],
    tolerance: f32,
) -> Option<String> {
    let target = host.snapshot().pose.position[0];
    for (i, channel) in followers.iter().enumerate() {
        let Some(replica) = channel.remote_element(host.id()) else {
            return Some(format!("follower {} has no replica", i + 1));
        };
        let x = replica.snapshot().pose.position[0];
        if (x - target).abs() > tolerance {
            return Some(format!("follower {} at x={x:.2}, host at x={target:.2}", i + 1));
        }
    }
    None
}

fn observe<T: ScenarioElement>(channel: &Channel<T>, node: usize, sink: &SampleSink) {
    let sink = Arc::clone(sink);
    let id = vsnet_core::ChannelHandle::id(channel);
    channel.set_update_observer(Arc::new(move |info, timestamp, applied_at| {
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LatencySample::new(node, id, info, timestamp, applied_at));
    }));
}

fn take(sink: &SampleSink) -> Vec<LatencySample> {
    std::mem::take(&mut *sink.lock().unwrap_or_else(PoisonError::into_inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ScenarioRunner {
        ScenarioRunner::new(42, 3).with_duration(3.0)
    }

    #[test]
    fn test_clock_sync() {
        let result = runner().run(ScenarioId::ClockSync);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.sync_time_ms.is_some());
        assert!(result.metrics.max_clock_skew_ms <= MIN_CLOCK_ACCURACY);
    }

    #[test]
    fn test_pose_replication() {
        let result = runner().run(ScenarioId::PoseReplication);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.samples.iter().any(|s| s.node == 2));
        assert!(result.metrics.delay.mean_ms < 60.0);
    }

    #[test]
    fn test_recorded_replay() {
        let result = runner().run(ScenarioId::RecordedReplay);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.delay.max_ms >= 10);
    }

    #[test]
    fn test_poisson_burst() {
        let result = runner().run(ScenarioId::PoissonBurst);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_haptic_loopback() {
        let result = runner().run(ScenarioId::HapticLoopback);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_lossy_link() {
        let result = runner().run(ScenarioId::LossyLink);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.packets_dropped > 0);
    }

    #[test]
    fn test_runs_are_deterministic() {
        let a = runner().run(ScenarioId::PoseReplication);
        let b = runner().run(ScenarioId::PoseReplication);
        assert_eq!(a.samples, b.samples);
        assert_eq!(a.metrics.packets_sent, b.metrics.packets_sent);
    }
}
