//! Membership traces: the schedule of cluster sizes a benchmark walks through.
//!
//! Both replayers emit [`TraceStep`]s carrying abstract member positions, not
//! identities. Position `i` is mapped onto a real member later; the
//! controller removes the highest positions first, which is the tail of the
//! registry's discovery order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};

use crate::error::{ClusterError, Result};

/// One scheduled size change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceStep {
    /// Zero-based step number.
    pub index: usize,
    /// Logical trace time in seconds (recorded traces only).
    pub at: Option<f64>,
    pub previous: usize,
    pub size: usize,
    pub joining: Vec<usize>,
    pub leaving: Vec<usize>,
}

impl TraceStep {
    /// `previous + |joining| - |leaving| == size`.
    pub fn is_consistent(&self) -> bool {
        self.previous + self.joining.len() == self.size + self.leaving.len()
    }
}

/// Source of trace steps. `Ok(None)` marks the end of the trace.
#[async_trait]
pub trait TraceReplayer: Send {
    fn initial_size(&self) -> usize;

    async fn next_step(&mut self) -> Result<Option<TraceStep>>;
}

/// Fixed list of target sizes.
#[derive(Clone, Debug)]
pub struct SyntheticTrace {
    sizes: Vec<usize>,
    next: usize,
    current: usize,
}

impl SyntheticTrace {
    pub fn new(sizes: Vec<usize>) -> Self {
        Self {
            sizes,
            next: 0,
            current: 0,
        }
    }
}

#[async_trait]
impl TraceReplayer for SyntheticTrace {
    fn initial_size(&self) -> usize {
        self.sizes.first().copied().unwrap_or(0)
    }

    async fn next_step(&mut self) -> Result<Option<TraceStep>> {
        let Some(&size) = self.sizes.get(self.next) else {
            return Ok(None);
        };
        let step = TraceStep {
            index: self.next,
            at: None,
            previous: self.current,
            size,
            joining: (self.current..size).collect(),
            leaving: (size..self.current).collect(),
        };
        self.next += 1;
        self.current = size;
        Ok(Some(step))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Up,
    Down,
}

/// One recorded availability event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub node_id: String,
    pub event_type: EventKind,
    /// Seconds on the trace's own time axis.
    pub event_start_time: f64,
}

/// Read-only view over a recorded event store.
pub trait TraceSource: Send + Sync {
    /// `(min, max)` event start time, after any overrides.
    fn time_bounds(&self) -> (f64, f64);

    /// Distinct node ids with at least one event at or before `at`, sorted.
    fn initial_nodes(&self, at: f64) -> Vec<String>;

    /// Events with `after < start <= until` for the given nodes, ordered by
    /// node then time. `after == None` is unbounded below.
    fn events_between(&self, after: Option<f64>, until: f64, nodes: &BTreeSet<String>) -> Vec<TraceEvent>;
}

/// In-memory event store.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    events: Vec<TraceEvent>,
    min_time: f64,
    max_time: f64,
}

impl EventLog {
    pub fn from_events(mut events: Vec<TraceEvent>) -> Self {
        events.sort_by(|a, b| {
            a.event_start_time
                .total_cmp(&b.event_start_time)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        let min_time = events.first().map(|e| e.event_start_time).unwrap_or(0.0);
        let max_time = events.last().map(|e| e.event_start_time).unwrap_or(0.0);
        Self {
            events,
            min_time,
            max_time,
        }
    }

    /// Load one JSON event per line. Blank lines are skipped.
    pub fn load_jsonl(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ClusterError::Trace(format!("read {}: {err}", path.display())))?;
        Self::parse_jsonl(&raw)
    }

    pub fn parse_jsonl(raw: &str) -> Result<Self> {
        let mut events = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: TraceEvent = serde_json::from_str(line)
                .map_err(|err| ClusterError::Trace(format!("line {}: {err}", lineno + 1)))?;
            events.push(event);
        }
        Ok(Self::from_events(events))
    }

    /// Override the nominal start and/or end of the trace.
    pub fn with_bounds(mut self, min_time: Option<f64>, max_time: Option<f64>) -> Self {
        if let Some(min) = min_time {
            self.min_time = min;
        }
        if let Some(max) = max_time {
            self.max_time = max;
        }
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl TraceSource for EventLog {
    fn time_bounds(&self) -> (f64, f64) {
        (self.min_time, self.max_time)
    }

    fn initial_nodes(&self, at: f64) -> Vec<String> {
        let ids: BTreeSet<&str> = self
            .events
            .iter()
            .take_while(|e| e.event_start_time <= at)
            .map(|e| e.node_id.as_str())
            .collect();
        ids.into_iter().map(str::to_string).collect()
    }

    fn events_between(&self, after: Option<f64>, until: f64, nodes: &BTreeSet<String>) -> Vec<TraceEvent> {
        let mut out: Vec<TraceEvent> = self
            .events
            .iter()
            .filter(|e| after.map(|a| e.event_start_time > a).unwrap_or(true))
            .take_while(|e| e.event_start_time <= until)
            .filter(|e| nodes.contains(&e.node_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.node_id
                .cmp(&b.node_id)
                .then_with(|| a.event_start_time.total_cmp(&b.event_start_time))
        });
        out
    }
}

/// Time base for recorded replay.
#[async_trait]
pub trait Clock: Send + Sync {
    fn elapsed(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Tokio-backed clock measuring from construction.
#[derive(Clone, Debug)]
pub struct WallClock {
    started: Instant,
}

impl Default for WallClock {
    fn default() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for WallClock {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        time::sleep(duration).await;
    }
}

/// Clock that only moves when slept on or advanced.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Configuration for [`RecordedTrace`].
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    /// Trace seconds per wall-clock second.
    pub time_factor: f64,
    /// Wall-clock interval between ticks without a membership change.
    pub poll_interval: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            time_factor: 1.0,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Replays a recorded up/down event log against a scaled clock.
///
/// Only nodes observed at or before the trace start take part. They all start
/// up; the first step brings the cluster from zero to that set. Every later
/// step aggregates the events of one or more ticks into net joins and leaves.
pub struct RecordedTrace<S, C> {
    source: S,
    clock: C,
    cfg: ReplayConfig,
    nodes: Vec<String>,
    members: BTreeSet<String>,
    up: Vec<bool>,
    base: Option<Duration>,
    last: Option<f64>,
    index: usize,
}

impl<S: TraceSource, C: Clock> RecordedTrace<S, C> {
    pub fn new(source: S, clock: C, cfg: ReplayConfig) -> Self {
        let (min, _) = source.time_bounds();
        let nodes = source.initial_nodes(min);
        let members = nodes.iter().cloned().collect();
        let up = vec![false; nodes.len()];
        Self {
            source,
            clock,
            cfg,
            nodes,
            members,
            up,
            base: None,
            last: None,
            index: 0,
        }
    }

    fn current_size(&self) -> usize {
        self.up.iter().filter(|u| **u).count()
    }

    fn logical_now(&self) -> f64 {
        let (min, _) = self.source.time_bounds();
        let base = self.base.unwrap_or_default();
        let elapsed = self.clock.elapsed().saturating_sub(base);
        min + elapsed.as_secs_f64() * self.cfg.time_factor
    }

    fn emit(&mut self, at: f64, previous: usize, joining: Vec<usize>, leaving: Vec<usize>) -> TraceStep {
        let step = TraceStep {
            index: self.index,
            at: Some(at),
            previous,
            size: self.current_size(),
            joining,
            leaving,
        };
        self.index += 1;
        step
    }

    /// Net state changes of the initial nodes in `(last, now]`.
    fn tick(&mut self, now: f64) -> (Vec<usize>, Vec<usize>) {
        let positions: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(pos, id)| (id.as_str(), pos))
            .collect();
        let mut net: BTreeMap<usize, i64> = BTreeMap::new();
        for event in self.source.events_between(self.last, now, &self.members) {
            if let Some(&pos) = positions.get(event.node_id.as_str()) {
                let delta = match event.event_type {
                    EventKind::Up => 1,
                    EventKind::Down => -1,
                };
                *net.entry(pos).or_insert(0) += delta;
            }
        }
        self.last = Some(now);

        let mut joining = Vec::new();
        let mut leaving = Vec::new();
        for (pos, delta) in net {
            if delta > 0 && !self.up[pos] {
                self.up[pos] = true;
                joining.push(pos);
            } else if delta < 0 && self.up[pos] {
                self.up[pos] = false;
                leaving.push(pos);
            }
        }
        (joining, leaving)
    }
}

#[async_trait]
impl<S, C> TraceReplayer for RecordedTrace<S, C>
where
    S: TraceSource,
    C: Clock,
{
    fn initial_size(&self) -> usize {
        self.nodes.len()
    }

    async fn next_step(&mut self) -> Result<Option<TraceStep>> {
        let (min, max) = self.source.time_bounds();
        if self.base.is_none() {
            self.base = Some(self.clock.elapsed());
            self.last = Some(min);
            let joining: Vec<usize> = (0..self.nodes.len()).collect();
            self.up.iter_mut().for_each(|u| *u = true);
            return Ok(Some(self.emit(min, 0, joining, Vec::new())));
        }
        loop {
            if self.last.map(|l| l > max).unwrap_or(false) {
                return Ok(None);
            }
            let now = self.logical_now();
            let previous = self.current_size();
            let (joining, leaving) = self.tick(now);
            if !joining.is_empty() || !leaving.is_empty() {
                tracing::debug!(at = now, joining = joining.len(), leaving = leaving.len(), "trace tick");
                return Ok(Some(self.emit(now, previous, joining, leaving)));
            }
            if now > max {
                return Ok(None);
            }
            self.clock.sleep(self.cfg.poll_interval).await;
        }
    }
}
