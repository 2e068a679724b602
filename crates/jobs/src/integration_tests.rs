//! Integration tests for the acquisition pipeline.
//!
//! Tests: JobService → JobStore → AcquisitionLoop → WorkerDispatcher → JobExecutor
//!
//! Verifies:
//! - Jobs created on one node are executed exactly once across competing nodes
//! - Failing jobs exhaust their retries and raise a single incident
//! - Acquisition ordering and lease exclusivity hold for arbitrary inputs

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;

    use stepflow_core::{Clock, EngineError, JobId, ManualClock, ProcessInstanceId, SystemClock};

    use crate::acquisition::AcquisitionLoop;
    use crate::config::JobExecutorConfig;
    use crate::context::AlwaysAvailable;
    use crate::dispatcher::{ReleaseLocks, WorkerDispatcher};
    use crate::handler::FnHandler;
    use crate::service::JobService;
    use crate::store::{InMemoryJobStore, JobStore};
    use crate::types::{AcquisitionOrder, FAILED_JOB_INCIDENT, JobFilter, NewJob};

    fn fast_config(owner: &str) -> JobExecutorConfig {
        JobExecutorConfig {
            wait_time_in_millis: 5,
            max_wait_in_millis: 20,
            ..JobExecutorConfig::default()
        }
        .with_lock_owner(owner)
    }

    fn dispatcher(name: &str) -> Arc<WorkerDispatcher> {
        Arc::new(
            WorkerDispatcher::new(name, 2, 8, Arc::new(AlwaysAvailable), Arc::new(ReleaseLocks))
                .unwrap(),
        )
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn competing_nodes_execute_each_job_once() {
        let store: Arc<dyn JobStore> = InMemoryJobStore::arc();
        let runs: Arc<Mutex<HashMap<JobId, Vec<String>>>> = Arc::default();

        let mut handles = Vec::new();
        let mut dispatchers = Vec::new();
        let mut services = Vec::new();
        for owner in ["node-a", "node-b"] {
            let config = fast_config(owner);
            let service = Arc::new(JobService::new(
                owner,
                store.clone(),
                Arc::new(SystemClock),
                &config,
            ));
            let runs = runs.clone();
            let node = owner.to_string();
            service.register_handler(Arc::new(FnHandler::new("record", move |ctx| {
                runs.lock()
                    .unwrap()
                    .entry(ctx.job.id)
                    .or_default()
                    .push(node.clone());
                Ok(())
            })));
            let dispatcher = dispatcher(owner);
            let handle = AcquisitionLoop::new(&config, vec![service.clone()], dispatcher.clone())
                .unwrap()
                .spawn()
                .unwrap();
            handles.push(handle);
            dispatchers.push(dispatcher);
            services.push(service);
        }

        let ids: Vec<JobId> = (0..40)
            .map(|i| {
                let pi = ProcessInstanceId::new();
                services[i % 2]
                    .create_job(
                        NewJob::new("record", json!({ "n": i }))
                            .for_execution(pi.root_execution_id(), pi)
                            .with_priority((i % 5) as i64),
                    )
                    .unwrap()
            })
            .collect();

        wait_until(|| store.list(&JobFilter::default()).unwrap().is_empty());
        for handle in handles {
            handle.shutdown();
        }
        for dispatcher in dispatchers {
            dispatcher.shutdown();
        }

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), ids.len());
        for id in &ids {
            assert_eq!(runs[id].len(), 1, "job {id} ran {:?}", runs[id]);
        }
        assert!(store.list_incidents(None).unwrap().is_empty());
    }

    #[test]
    fn failing_job_exhausts_retries_into_one_incident() {
        let config = fast_config("node-a");
        let jobs = Arc::new(JobService::new(
            "jobs",
            InMemoryJobStore::arc(),
            Arc::new(SystemClock),
            &config,
        ));
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        jobs.register_handler(Arc::new(FnHandler::new("flaky", move |_| {
            *counter.lock().unwrap() += 1;
            Err(EngineError::failure("remote system unavailable"))
        })));

        let dispatcher = dispatcher("jobs");
        let handle = AcquisitionLoop::new(&config, vec![jobs.clone()], dispatcher.clone())
            .unwrap()
            .spawn()
            .unwrap();
        let pi = ProcessInstanceId::new();
        let id = jobs
            .create_job(NewJob::new("flaky", json!({})).for_execution(pi.root_execution_id(), pi))
            .unwrap();

        wait_until(|| !jobs.incidents(Some(pi)).unwrap().is_empty());
        // A failed job is never acquired again.
        std::thread::sleep(Duration::from_millis(50));
        handle.shutdown();
        dispatcher.shutdown();

        assert_eq!(*attempts.lock().unwrap(), 3);
        let job = jobs.find_job(id).unwrap().unwrap();
        assert_eq!(job.retries, 0);
        assert_eq!(
            job.exception_message.as_deref(),
            Some("execution failed: remote system unavailable")
        );
        let incidents = jobs.incidents(Some(pi)).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident_type, FAILED_JOB_INCIDENT);
        assert_eq!(incidents[0].job_id, Some(id));
        assert_eq!(jobs.executor().stats().incidents_created, 1);
    }

    #[test]
    fn lease_expiry_lets_another_node_take_over() {
        let clock = ManualClock::new(Utc::now());
        let store = InMemoryJobStore::new();
        let job = NewJob::new("timer", json!({})).into_job(JobId::new(), 3, clock.now());
        let id = store.insert(job).unwrap().id;

        let lease = Duration::from_secs(300);
        assert!(store.try_lock(id, "node-a", lease, clock.now()).unwrap());
        assert!(!store.try_lock(id, "node-b", lease, clock.now()).unwrap());

        clock.advance(Duration::from_secs(301));
        assert!(store.try_lock(id, "node-b", lease, clock.now()).unwrap());
        assert!(!store.unlock(id, "node-a").unwrap());
        assert_eq!(
            store.find_by_id(id).unwrap().unwrap().lock_owner.as_deref(),
            Some("node-b")
        );
    }

    proptest! {
        #[test]
        fn candidates_come_in_priority_then_id_order(priorities in prop::collection::vec(-5i64..5, 1..30), limit in 1usize..40) {
            let clock = ManualClock::new(Utc::now());
            let store = InMemoryJobStore::new();
            for (i, priority) in priorities.iter().enumerate() {
                let job = NewJob::new("t", json!({}))
                    .with_priority(*priority)
                    .into_job(JobId::from_u128(i as u128 + 1), 3, clock.now());
                store.insert(job).unwrap();
            }

            let found = store.find_due_unlocked(clock.now(), limit, AcquisitionOrder::Priority).unwrap();
            prop_assert_eq!(found.len(), limit.min(priorities.len()));
            for pair in found.windows(2) {
                let ordered = pair[0].priority > pair[1].priority
                    || (pair[0].priority == pair[1].priority && pair[0].id < pair[1].id);
                prop_assert!(ordered);
            }
        }

        #[test]
        fn at_most_one_owner_holds_a_lease(attempts in prop::collection::vec((0usize..4, 0usize..3), 1..40)) {
            let clock = ManualClock::new(Utc::now());
            let store = InMemoryJobStore::new();
            let ids: Vec<JobId> = (0..4)
                .map(|i| {
                    let job = NewJob::new("t", json!({})).into_job(JobId::from_u128(i + 1), 3, clock.now());
                    store.insert(job).unwrap().id
                })
                .collect();
            let owners = ["a", "b", "c"];
            let mut holders: HashMap<JobId, &str> = HashMap::new();

            for (job, owner) in attempts {
                let id = ids[job];
                let locked = store.try_lock(id, owners[owner], Duration::from_secs(60), clock.now()).unwrap();
                match holders.get(&id) {
                    Some(_) => prop_assert!(!locked),
                    None => {
                        prop_assert!(locked);
                        holders.insert(id, owners[owner]);
                    }
                }
                let stored = store.find_by_id(id).unwrap().unwrap();
                prop_assert_eq!(stored.lock_owner.as_deref(), holders.get(&id).copied());
            }
        }
    }
}
