//! Job acquisition: strategies and the background acquisition loop.
//!
//! Each cycle asks the strategy which job source to query and how many jobs
//! to request, locks the due candidates in order, groups the locked jobs per
//! process instance and hands the batches to the dispatcher. When a full round
//! over all sources locked nothing, the loop backs off; creating a due job
//! wakes it early.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stepflow_core::{
    Backoff, Clock, DeploymentId, EngineError, EngineResult, JobId, ProcessInstanceId,
};

use crate::command::CommandExecutor;
use crate::config::{ConfigError, JobExecutorConfig};
use crate::dispatcher::{Batch, BatchRunner, DispatchOutcome, WorkerDispatcher};
use crate::handler::DispatchClass;
use crate::service::JobService;
use crate::types::{AcquirableJob, AcquisitionOrder};

/// Control messages of a running loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LoopMessage {
    Wake,
    Stop,
}

/// What the strategy wants the next cycle to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CyclePlan {
    pub source_index: usize,
    pub max_jobs: usize,
    /// Last cycle of a round over all sources; backoff is applied after it.
    pub round_complete: bool,
}

/// Result of one cycle, fed back into the strategy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CycleOutcome {
    pub requested: usize,
    pub candidates: usize,
    pub locked: usize,
    /// Candidates another owner locked first.
    pub lost: usize,
    pub errors: usize,
}

/// Chooses the source and batch size of each acquisition cycle.
pub trait AcquisitionStrategy: Send {
    fn name(&self) -> &str;

    fn next_cycle(&mut self) -> CyclePlan;

    fn record(&mut self, source_index: usize, outcome: &CycleOutcome);
}

/// Round-robin over the sources with a fixed batch size.
#[derive(Debug, Clone)]
pub struct SequentialStrategy {
    sources: usize,
    next: usize,
    max_jobs: usize,
}

impl SequentialStrategy {
    pub fn new(sources: usize, max_jobs: usize) -> Self {
        Self {
            sources: sources.max(1),
            next: 0,
            max_jobs,
        }
    }
}

impl AcquisitionStrategy for SequentialStrategy {
    fn name(&self) -> &str {
        "SEQUENTIAL"
    }

    fn next_cycle(&mut self) -> CyclePlan {
        let source_index = self.next;
        self.next = (self.next + 1) % self.sources;
        CyclePlan {
            source_index,
            max_jobs: self.max_jobs,
            round_complete: source_index + 1 == self.sources,
        }
    }

    fn record(&mut self, _source_index: usize, _outcome: &CycleOutcome) {}
}

/// Round-robin with a batch size per source that grows while cycles come back
/// full and shrinks when most lock attempts lose to other nodes.
#[derive(Debug, Clone)]
pub struct AdaptiveStrategy {
    next: usize,
    base: usize,
    cap: usize,
    batch_sizes: Vec<usize>,
}

impl AdaptiveStrategy {
    pub fn new(sources: usize, base: usize, cap: usize) -> Self {
        let base = base.max(1);
        Self {
            next: 0,
            base,
            cap: cap.max(base),
            batch_sizes: vec![base; sources.max(1)],
        }
    }

    pub fn batch_size(&self, source_index: usize) -> usize {
        self.batch_sizes[source_index]
    }
}

impl AcquisitionStrategy for AdaptiveStrategy {
    fn name(&self) -> &str {
        "ADAPTIVE"
    }

    fn next_cycle(&mut self) -> CyclePlan {
        let source_index = self.next;
        self.next = (self.next + 1) % self.batch_sizes.len();
        CyclePlan {
            source_index,
            max_jobs: self.batch_sizes[source_index],
            round_complete: source_index + 1 == self.batch_sizes.len(),
        }
    }

    fn record(&mut self, source_index: usize, outcome: &CycleOutcome) {
        let Some(size) = self.batch_sizes.get_mut(source_index) else {
            return;
        };
        if outcome.candidates > 0 && outcome.lost * 2 > outcome.candidates {
            *size = (*size / 2).max(self.base);
        } else if outcome.requested > 0 && outcome.locked >= outcome.requested {
            *size = (*size * 2).min(self.cap);
        }
    }
}

/// Strategy names accepted in configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AcquisitionStrategyKind {
    #[default]
    #[serde(rename = "SEQUENTIAL", alias = "sequential")]
    Sequential,
    #[serde(rename = "ADAPTIVE", alias = "adaptive")]
    Adaptive,
}

impl AcquisitionStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionStrategyKind::Sequential => "SEQUENTIAL",
            AcquisitionStrategyKind::Adaptive => "ADAPTIVE",
        }
    }

    pub fn build(&self, sources: usize, config: &JobExecutorConfig) -> Box<dyn AcquisitionStrategy> {
        match self {
            AcquisitionStrategyKind::Sequential => Box::new(SequentialStrategy::new(
                sources,
                config.max_jobs_per_acquisition,
            )),
            AcquisitionStrategyKind::Adaptive => Box::new(AdaptiveStrategy::new(
                sources,
                config.max_jobs_per_acquisition,
                config.max_jobs_per_acquisition_cap,
            )),
        }
    }
}

impl fmt::Display for AcquisitionStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcquisitionStrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SEQUENTIAL" => Ok(AcquisitionStrategyKind::Sequential),
            "ADAPTIVE" => Ok(AcquisitionStrategyKind::Adaptive),
            _ => Err(ConfigError::InvalidValue {
                key: "acquisition_strategy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Snapshot of a loop's state and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionStats {
    pub strategy: String,
    pub lock_owner: String,
    pub lock_time_ms: u64,
    pub cycles: u64,
    pub jobs_acquired: u64,
    pub lock_failures: u64,
    pub store_errors: u64,
    pub batches_dispatched: u64,
    pub batches_rejected: u64,
    /// Consecutive empty rounds.
    pub backoff_level: u32,
    pub current_wait_ms: u64,
    /// Batch size requested by the latest cycle.
    pub max_jobs_per_acquisition: usize,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub source_index: usize,
    /// Locked jobs, in lock order.
    pub locked: Vec<JobId>,
    /// Job ids per dispatched batch.
    pub batches: Vec<Vec<JobId>>,
    pub rejected: usize,
    pub outcome: CycleOutcome,
    /// Idle wait before the next cycle.
    pub wait: Duration,
}

/// Acquisition loop over one or more job sources.
pub struct AcquisitionLoop {
    name: String,
    sources: Vec<Arc<JobService>>,
    dispatcher: Arc<WorkerDispatcher>,
    strategy: Box<dyn AcquisitionStrategy>,
    command: CommandExecutor,
    backoff: Backoff,
    lock_owner: String,
    lock_time: Duration,
    order: AcquisitionOrder,
    round_found_any: bool,
    stats: Arc<Mutex<AcquisitionStats>>,
}

impl AcquisitionLoop {
    pub fn new(
        config: &JobExecutorConfig,
        sources: Vec<Arc<JobService>>,
        dispatcher: Arc<WorkerDispatcher>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if sources.is_empty() {
            return Err(ConfigError::Invalid(
                "acquisition needs at least one job source".to_string(),
            ));
        }
        let strategy = config.acquisition_strategy.build(sources.len(), config);
        let lock_owner = config.resolved_lock_owner();
        let stats = AcquisitionStats {
            strategy: strategy.name().to_string(),
            lock_owner: lock_owner.clone(),
            lock_time_ms: config.lock_time_in_millis,
            max_jobs_per_acquisition: config.max_jobs_per_acquisition,
            ..AcquisitionStats::default()
        };

        Ok(Self {
            name: "job-acquisition".to_string(),
            sources,
            dispatcher,
            strategy,
            command: CommandExecutor::new(config.command_retries),
            backoff: Backoff::new(config.backoff_policy()),
            lock_owner,
            lock_time: config.lock_time(),
            order: config.acquisition_order(),
            round_found_any: false,
            stats: Arc::new(Mutex::new(stats)),
        })
    }

    /// Replace the configured strategy.
    pub fn with_strategy(mut self, strategy: Box<dyn AcquisitionStrategy>) -> Self {
        self.update_stats(|s| s.strategy = strategy.name().to_string());
        self.strategy = strategy;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Run one acquisition cycle on the calling thread.
    pub fn run_cycle(&mut self) -> CycleReport {
        let plan = self.strategy.next_cycle();
        let source = self.sources[plan.source_index].clone();
        let now = source.clock().now();
        let mut outcome = CycleOutcome {
            requested: plan.max_jobs,
            ..CycleOutcome::default()
        };

        let candidates = match self.command.execute("acquire-jobs", || {
            source
                .store()
                .find_due_unlocked(now, plan.max_jobs, self.order)
                .map_err(EngineError::from)
        }) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(source = %source.name(), error = %err, "failed to query due jobs");
                outcome.errors += 1;
                Vec::new()
            }
        };
        outcome.candidates = candidates.len();

        let mut locked = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match source
                .store()
                .try_lock(candidate.id, &self.lock_owner, self.lock_time, now)
            {
                Ok(true) => locked.push(candidate),
                Ok(false) => outcome.lost += 1,
                Err(err) => {
                    debug!(job_id = %candidate.id, error = %err, "lock attempt failed");
                    outcome.errors += 1;
                }
            }
        }
        outcome.locked = locked.len();

        let runner: Arc<dyn BatchRunner> = source.executor().clone();
        let batches = group_batches(&locked, &self.lock_owner, &runner, |handler_type| {
            source.dispatch_class(handler_type)
        });
        let batch_ids: Vec<Vec<JobId>> = batches.iter().map(|b| b.job_ids.clone()).collect();

        let mut rejected = 0;
        for batch in batches {
            if self.dispatcher.dispatch(batch) == DispatchOutcome::Rejected {
                rejected += 1;
            }
        }

        self.strategy.record(plan.source_index, &outcome);
        self.round_found_any |= outcome.locked > 0;
        let wait = if plan.round_complete {
            self.backoff.reconfigure(self.round_found_any);
            self.round_found_any = false;
            self.backoff.wait()
        } else {
            Duration::ZERO
        };

        if outcome.locked > 0 {
            debug!(
                source = %source.name(),
                locked = outcome.locked,
                lost = outcome.lost,
                batches = batch_ids.len(),
                "acquired jobs"
            );
        }

        let backoff_level = self.backoff.level();
        self.update_stats(|s| {
            s.cycles += 1;
            s.jobs_acquired += outcome.locked as u64;
            s.lock_failures += outcome.lost as u64;
            s.store_errors += outcome.errors as u64;
            s.batches_dispatched += (batch_ids.len() - rejected) as u64;
            s.batches_rejected += rejected as u64;
            s.backoff_level = backoff_level;
            s.current_wait_ms = wait.as_millis() as u64;
            s.max_jobs_per_acquisition = plan.max_jobs;
        });

        CycleReport {
            source_index: plan.source_index,
            locked: locked.iter().map(|j| j.id).collect(),
            batches: batch_ids,
            rejected,
            outcome,
            wait,
        }
    }

    /// Start the loop on its own thread.
    pub fn spawn(self) -> EngineResult<AcquisitionHandle> {
        let (control, rx) = mpsc::channel::<LoopMessage>();
        for source in &self.sources {
            source.signal().subscribe(control.clone());
        }
        let stats = self.stats.clone();
        let name = self.name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(rx))
            .map_err(|e| {
                EngineError::infrastructure(format!("failed to spawn acquisition thread: {e}"))
            })?;

        Ok(AcquisitionHandle {
            name,
            control,
            join: Some(join),
            stats,
        })
    }

    fn run(mut self, rx: mpsc::Receiver<LoopMessage>) {
        info!(acquisition = %self.name, lock_owner = %self.lock_owner, "job acquisition started");
        'cycles: loop {
            loop {
                match rx.try_recv() {
                    Ok(LoopMessage::Stop) | Err(mpsc::TryRecvError::Disconnected) => {
                        break 'cycles;
                    }
                    Ok(LoopMessage::Wake) => {}
                    Err(mpsc::TryRecvError::Empty) => break,
                }
            }

            let report = self.run_cycle();
            if report.wait.is_zero() {
                continue;
            }

            debug!(acquisition = %self.name, wait_ms = report.wait.as_millis() as u64, "no jobs due, backing off");
            match rx.recv_timeout(report.wait) {
                Ok(LoopMessage::Wake) => debug!(acquisition = %self.name, "woken up by new job"),
                Ok(LoopMessage::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
        info!(acquisition = %self.name, "job acquisition stopped");
    }

    fn update_stats(&self, f: impl FnOnce(&mut AcquisitionStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }
}

impl fmt::Debug for AcquisitionLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionLoop")
            .field("name", &self.name)
            .field("sources", &self.sources.len())
            .field("strategy", &self.strategy.name())
            .field("lock_owner", &self.lock_owner)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Handle to control a running acquisition loop.
#[derive(Debug)]
pub struct AcquisitionHandle {
    name: String,
    control: mpsc::Sender<LoopMessage>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<AcquisitionStats>>,
}

impl AcquisitionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Skip the current idle wait.
    pub fn wake(&self) {
        let _ = self.control.send(LoopMessage::Wake);
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Stop the loop and wait for it. Every batch it handed over has been
    /// dispatched when this returns.
    pub fn shutdown(mut self) {
        let _ = self.control.send(LoopMessage::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.control.send(LoopMessage::Stop);
        }
    }
}

/// Group locked jobs into batches, one per (deployment, process instance).
/// Jobs without a process instance run alone. First-seen order is kept.
fn group_batches<F>(
    locked: &[AcquirableJob],
    lock_owner: &str,
    runner: &Arc<dyn BatchRunner>,
    class_of: F,
) -> Vec<Batch>
where
    F: Fn(&str) -> DispatchClass,
{
    let mut batches: Vec<Batch> = Vec::new();
    let mut index: HashMap<(Option<DeploymentId>, ProcessInstanceId), usize> = HashMap::new();

    for job in locked {
        let class = class_of(&job.handler_type);
        let slot = job
            .process_instance_id
            .and_then(|pi| index.get(&(job.deployment_id, pi)).copied());

        match slot {
            Some(i) => {
                let batch = &mut batches[i];
                batch.job_ids.push(job.id);
                if class == DispatchClass::LongRunning {
                    batch.class = DispatchClass::LongRunning;
                }
            }
            None => {
                if let Some(pi) = job.process_instance_id {
                    index.insert((job.deployment_id, pi), batches.len());
                }
                batches.push(
                    Batch::new(vec![job.id], lock_owner, runner.clone())
                        .with_context(job.deployment_id, job.process_instance_id)
                        .with_class(class),
                );
            }
        }
    }
    batches
}
