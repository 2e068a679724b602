//! Worker dispatcher: runs acquired batches inside their deployment context.
//!
//! Short-running batches go to a fixed pool of worker threads fed through a
//! bounded queue; a full queue rejects the batch and hands it to a
//! [`RejectedBatchHandler`]. Long-running batches get a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

use stepflow_core::{DeploymentId, EngineError, EngineResult, JobId, ProcessInstanceId};

use crate::context::DeploymentContextProvider;
use crate::handler::DispatchClass;

/// Runs (or gives back) the jobs of a batch. Implemented per job source.
pub trait BatchRunner: Send + Sync {
    fn run_batch(&self, batch: &Batch);

    /// Give up the batch's leases so the next cycle can acquire the jobs again.
    fn release_batch(&self, batch: &Batch);
}

/// Locked jobs of one (deployment, process instance) pair.
#[derive(Clone)]
pub struct Batch {
    pub job_ids: Vec<JobId>,
    pub lock_owner: String,
    pub deployment_id: Option<DeploymentId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub class: DispatchClass,
    pub runner: Arc<dyn BatchRunner>,
}

impl Batch {
    pub fn new(
        job_ids: Vec<JobId>,
        lock_owner: impl Into<String>,
        runner: Arc<dyn BatchRunner>,
    ) -> Self {
        Self {
            job_ids,
            lock_owner: lock_owner.into(),
            deployment_id: None,
            process_instance_id: None,
            class: DispatchClass::ShortRunning,
            runner,
        }
    }

    pub fn with_context(
        mut self,
        deployment_id: Option<DeploymentId>,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> Self {
        self.deployment_id = deployment_id;
        self.process_instance_id = process_instance_id;
        self
    }

    pub fn with_class(mut self, class: DispatchClass) -> Self {
        self.class = class;
        self
    }

    pub fn len(&self) -> usize {
        self.job_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.job_ids.is_empty()
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("job_ids", &self.job_ids)
            .field("lock_owner", &self.lock_owner)
            .field("deployment_id", &self.deployment_id)
            .field("process_instance_id", &self.process_instance_id)
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

/// Decides what happens to a batch the pool could not take.
pub trait RejectedBatchHandler: Send + Sync {
    /// `run_here` executes the batch on the calling thread, inside its context.
    fn handle_rejected(&self, batch: Batch, run_here: &dyn Fn(Batch));
}

/// Release the leases at once so the next cycle picks the jobs up again.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReleaseLocks;

impl RejectedBatchHandler for ReleaseLocks {
    fn handle_rejected(&self, batch: Batch, _run_here: &dyn Fn(Batch)) {
        debug!(jobs = batch.len(), "releasing leases of rejected batch");
        batch.runner.release_batch(&batch);
    }
}

/// Run the batch on the acquisition thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerRuns;

impl RejectedBatchHandler for CallerRuns {
    fn handle_rejected(&self, batch: Batch, run_here: &dyn Fn(Batch)) {
        debug!(jobs = batch.len(), "running rejected batch on caller thread");
        run_here(batch);
    }
}

/// How the dispatcher took a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    Spawned,
    Rejected,
}

/// Bounded worker pool plus dedicated long-running threads.
pub struct WorkerDispatcher {
    name: String,
    sender: Mutex<Option<mpsc::SyncSender<Batch>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    long_running: Mutex<Vec<thread::JoinHandle<()>>>,
    stopped: AtomicBool,
    context: Arc<dyn DeploymentContextProvider>,
    rejected: Arc<dyn RejectedBatchHandler>,
}

impl WorkerDispatcher {
    /// Start `pool_size` workers sharing a queue of `queue_capacity` batches.
    pub fn new(
        name: impl Into<String>,
        pool_size: usize,
        queue_capacity: usize,
        context: Arc<dyn DeploymentContextProvider>,
        rejected: Arc<dyn RejectedBatchHandler>,
    ) -> EngineResult<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::sync_channel::<Batch>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let rx = rx.clone();
            let context = context.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || worker_loop(rx, context))
                .map_err(|e| EngineError::infrastructure(format!("failed to spawn worker: {e}")))?;
            workers.push(worker);
        }
        info!(dispatcher = %name, pool_size, queue_capacity, "worker dispatcher started");

        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            long_running: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            context,
            rejected,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a batch over. Never blocks on a full pool.
    pub fn dispatch(&self, batch: Batch) -> DispatchOutcome {
        match batch.class {
            DispatchClass::LongRunning => self.spawn_long_running(batch),
            DispatchClass::ShortRunning => self.enqueue(batch),
        }
    }

    fn enqueue(&self, batch: Batch) -> DispatchOutcome {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        let rejected = match sender.as_ref() {
            Some(tx) => match tx.try_send(batch) {
                Ok(()) => return DispatchOutcome::Queued,
                Err(mpsc::TrySendError::Full(b)) | Err(mpsc::TrySendError::Disconnected(b)) => b,
            },
            None => batch,
        };
        drop(sender);

        warn!(dispatcher = %self.name, jobs = rejected.len(), "worker pool full, batch rejected");
        self.reject(rejected)
    }

    fn reject(&self, batch: Batch) -> DispatchOutcome {
        let context = self.context.clone();
        self.rejected
            .handle_rejected(batch, &move |b| run_in_context(context.as_ref(), b));
        DispatchOutcome::Rejected
    }

    fn spawn_long_running(&self, batch: Batch) -> DispatchOutcome {
        let mut threads = self.long_running.lock().unwrap_or_else(|p| p.into_inner());
        if self.stopped.load(Ordering::SeqCst) {
            drop(threads);
            warn!(dispatcher = %self.name, jobs = batch.len(), "dispatcher stopped, long-running batch rejected");
            return self.reject(batch);
        }
        threads.retain(|t| !t.is_finished());

        let context = self.context.clone();
        let keep = batch.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-long-{}", self.name, threads.len()))
            .spawn(move || run_in_context(context.as_ref(), batch));
        match spawned {
            Ok(handle) => {
                threads.push(handle);
                DispatchOutcome::Spawned
            }
            Err(e) => {
                drop(threads);
                warn!(dispatcher = %self.name, error = %e, "failed to spawn long-running thread");
                self.reject(keep)
            }
        }
    }

    /// Stop accepting batches, drain the queue and join all threads.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.join();
        }
        let long_running: Vec<_> = self
            .long_running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for t in long_running {
            let _ = t.join();
        }
        info!(dispatcher = %self.name, "worker dispatcher stopped");
    }
}

impl std::fmt::Debug for WorkerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDispatcher")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Batch>>>, context: Arc<dyn DeploymentContextProvider>) {
    loop {
        let next = rx.lock().unwrap_or_else(|p| p.into_inner()).recv();
        match next {
            Ok(batch) => run_in_context(context.as_ref(), batch),
            Err(_) => break,
        }
    }
}

fn run_in_context(context: &dyn DeploymentContextProvider, batch: Batch) {
    let runner = batch.runner.clone();
    let result = context.run_in_context(batch.deployment_id, &mut || runner.run_batch(&batch));
    if let Err(err) = result {
        // Leases are left to expire; the jobs become acquirable again afterwards.
        warn!(
            deployment_id = ?batch.deployment_id,
            jobs = batch.len(),
            error = %err,
            "dropping batch, deployment context unavailable"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    use crate::context::{AlwaysAvailable, DeploymentRegistry};

    #[derive(Default)]
    struct Recorder {
        ran: Mutex<Vec<(Vec<JobId>, Option<DeploymentId>, Option<String>)>>,
        released: Mutex<Vec<Vec<JobId>>>,
        started: Option<Mutex<mpsc::Sender<()>>>,
        gate: Option<Arc<Barrier>>,
    }

    impl BatchRunner for Recorder {
        fn run_batch(&self, batch: &Batch) {
            self.ran.lock().unwrap().push((
                batch.job_ids.clone(),
                DeploymentRegistry::current(),
                thread::current().name().map(str::to_string),
            ));
            if let Some(started) = &self.started {
                let _ = started.lock().unwrap().send(());
            }
            if let Some(gate) = &self.gate {
                gate.wait();
            }
        }

        fn release_batch(&self, batch: &Batch) {
            self.released.lock().unwrap().push(batch.job_ids.clone());
        }
    }

    fn batch(runner: &Arc<Recorder>, id: u128) -> Batch {
        Batch::new(vec![JobId::from_u128(id)], "owner", runner.clone())
    }

    #[test]
    fn runs_queued_batches_and_drains_on_shutdown() {
        let runner = Arc::new(Recorder::default());
        let dispatcher =
            WorkerDispatcher::new("t", 2, 8, Arc::new(AlwaysAvailable), Arc::new(ReleaseLocks))
                .unwrap();
        for id in 0..5 {
            assert_eq!(dispatcher.dispatch(batch(&runner, id)), DispatchOutcome::Queued);
        }
        dispatcher.shutdown();
        assert_eq!(runner.ran.lock().unwrap().len(), 5);
    }

    #[test]
    fn full_pool_releases_locks() {
        // One worker held inside a batch, queue of one.
        let gate = Arc::new(Barrier::new(2));
        let (started_tx, started_rx) = mpsc::channel();
        let runner = Arc::new(Recorder {
            started: Some(Mutex::new(started_tx)),
            gate: Some(gate.clone()),
            ..Recorder::default()
        });
        let dispatcher =
            WorkerDispatcher::new("t", 1, 1, Arc::new(AlwaysAvailable), Arc::new(ReleaseLocks))
                .unwrap();

        assert_eq!(dispatcher.dispatch(batch(&runner, 1)), DispatchOutcome::Queued);
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(dispatcher.dispatch(batch(&runner, 2)), DispatchOutcome::Queued);
        assert_eq!(dispatcher.dispatch(batch(&runner, 3)), DispatchOutcome::Rejected);
        assert_eq!(
            runner.released.lock().unwrap().as_slice(),
            &[vec![JobId::from_u128(3)]]
        );

        gate.wait();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        gate.wait();
        dispatcher.shutdown();
        assert_eq!(runner.ran.lock().unwrap().len(), 2);
    }

    #[test]
    fn caller_runs_executes_on_calling_thread() {
        let runner = Arc::new(Recorder::default());
        let dispatcher =
            WorkerDispatcher::new("t", 1, 0, Arc::new(AlwaysAvailable), Arc::new(CallerRuns))
                .unwrap();
        // Capacity 0: with no worker waiting right now the batch may be rejected
        // and then runs here, or a waiting worker takes it. Both run it.
        dispatcher.dispatch(batch(&runner, 1));
        dispatcher.shutdown();
        assert_eq!(runner.ran.lock().unwrap().len(), 1);
    }

    #[test]
    fn long_running_batches_get_their_own_thread() {
        let runner = Arc::new(Recorder::default());
        let dispatcher =
            WorkerDispatcher::new("t", 1, 1, Arc::new(AlwaysAvailable), Arc::new(ReleaseLocks))
                .unwrap();
        let outcome = dispatcher.dispatch(batch(&runner, 1).with_class(DispatchClass::LongRunning));
        assert_eq!(outcome, DispatchOutcome::Spawned);
        dispatcher.shutdown();

        let ran = runner.ran.lock().unwrap();
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].2.as_deref(), Some("t-long-0"));
    }

    #[test]
    fn long_running_batches_are_rejected_after_shutdown() {
        let runner = Arc::new(Recorder::default());
        let dispatcher =
            WorkerDispatcher::new("t", 1, 1, Arc::new(AlwaysAvailable), Arc::new(ReleaseLocks))
                .unwrap();
        dispatcher.shutdown();

        let outcome = dispatcher.dispatch(batch(&runner, 7).with_class(DispatchClass::LongRunning));
        assert_eq!(outcome, DispatchOutcome::Rejected);
        assert!(runner.ran.lock().unwrap().is_empty());
        assert_eq!(
            runner.released.lock().unwrap().as_slice(),
            &[vec![JobId::from_u128(7)]]
        );
        assert!(dispatcher.long_running.lock().unwrap().is_empty());
    }

    #[test]
    fn batches_run_inside_their_deployment() {
        let registry = Arc::new(DeploymentRegistry::new());
        let installed = DeploymentId::new();
        registry.install(installed);

        let runner = Arc::new(Recorder::default());
        let dispatcher =
            WorkerDispatcher::new("t", 1, 4, registry.clone(), Arc::new(ReleaseLocks)).unwrap();
        dispatcher.dispatch(batch(&runner, 1).with_context(Some(installed), None));
        dispatcher.dispatch(batch(&runner, 2).with_context(Some(DeploymentId::new()), None));
        dispatcher.shutdown();

        let ran = runner.ran.lock().unwrap();
        assert_eq!(ran.len(), 1, "undeployable batch is dropped");
        assert_eq!(ran[0].0, vec![JobId::from_u128(1)]);
        assert_eq!(ran[0].1, Some(installed));
        assert!(runner.released.lock().unwrap().is_empty());
    }
}
