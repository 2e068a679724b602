//! Postgres-backed job store.
//!
//! Leases and revisions are enforced by the database: `try_lock` is a single
//! conditional `UPDATE` whose predicate repeats the acquirability rules, and
//! every other write is conditional on the revision the caller read. A lost
//! race shows up as zero affected rows, never as a database error.
//!
//! ## Error Mapping
//!
//! | SQLx error | JobStoreError |
//! |------------|---------------|
//! | Database, code `23505` (unique violation) | `AlreadyExists` on insert |
//! | Any other database error | `Storage` |
//! | PoolClosed / IO / other | `Storage` |
//!
//! ## Threading
//!
//! `JobStore` is synchronous; calls are bridged onto the tokio runtime whose
//! handle is passed in. From plain OS threads (acquisition and worker threads)
//! the call blocks on that handle directly. From a worker thread of a
//! multi-threaded runtime it goes through `block_in_place`. A current-thread
//! runtime cannot be blocked, so calls made from one fail with `Storage`
//! instead of panicking; async callers should prefer `spawn_blocking`.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::instrument;
use uuid::Uuid;

use stepflow_core::{
    DeploymentId, ExecutionId, IncidentId, JobId, ProcessDefinitionId, ProcessInstanceId,
};

use crate::store::{JobStore, JobStoreError};
use crate::types::{AcquirableJob, AcquisitionOrder, Incident, Job, JobFilter};

/// Tables used by [`PostgresJobStore`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                      UUID PRIMARY KEY,
    handler_type            TEXT NOT NULL,
    handler_configuration   JSONB NOT NULL,
    due_date                TIMESTAMPTZ NULL,
    lock_owner              TEXT NULL,
    lock_expiration_time    TIMESTAMPTZ NULL,
    retries                 INTEGER NOT NULL CHECK (retries >= 0),
    priority                BIGINT NOT NULL DEFAULT 0,
    execution_id            UUID NULL,
    process_instance_id     UUID NULL,
    process_definition_id   UUID NULL,
    deployment_id           UUID NULL,
    exception_message       TEXT NULL,
    suspended               BOOLEAN NOT NULL DEFAULT FALSE,
    revision                BIGINT NOT NULL,
    created_at              TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_acquisition_idx
    ON jobs (priority DESC, due_date ASC NULLS FIRST, id ASC)
    WHERE retries > 0 AND NOT suspended;
CREATE INDEX IF NOT EXISTS jobs_process_instance_idx ON jobs (process_instance_id);

CREATE TABLE IF NOT EXISTS job_incidents (
    id                      UUID PRIMARY KEY,
    incident_type           TEXT NOT NULL,
    job_id                  UUID NULL,
    external_task_id        UUID NULL,
    process_instance_id     UUID NULL,
    execution_id            UUID NULL,
    message                 TEXT NOT NULL,
    created_at              TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS job_incidents_job_idx ON job_incidents (job_id);
"#;

const JOB_COLUMNS: &str = "id, handler_type, handler_configuration, due_date, lock_owner, \
     lock_expiration_time, retries, priority, execution_id, process_instance_id, \
     process_definition_id, deployment_id, exception_message, suspended, revision, created_at";

/// Postgres-backed [`JobStore`].
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Run `operation` to completion from synchronous code.
    fn block<T>(
        &self,
        operation: impl Future<Output = Result<T, JobStoreError>>,
    ) -> Result<T, JobStoreError> {
        match Handle::try_current().map(|current| current.runtime_flavor()) {
            Err(_) => self.runtime.block_on(operation),
            Ok(RuntimeFlavor::CurrentThread) => Err(JobStoreError::Storage(
                "job store called from a current-thread async runtime; use spawn_blocking".into(),
            )),
            Ok(_) => tokio::task::block_in_place(|| self.runtime.block_on(operation)),
        }
    }

    async fn current_revision(&self, id: JobId) -> Result<Option<u64>, JobStoreError> {
        let row = sqlx::query("SELECT revision FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_revision", e))?;
        row.map(|r| r.try_get::<i64, _>("revision").map(|v| v as u64))
            .transpose()
            .map_err(|e| map_sqlx_error("current_revision", e))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert_async(&self, mut job: Job) -> Result<Job, JobStoreError> {
        job.revision = 1;
        sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(job.id.as_uuid())
        .bind(&job.handler_type)
        .bind(&job.handler_configuration)
        .bind(job.due_date)
        .bind(&job.lock_owner)
        .bind(job.lock_expiration_time)
        .bind(job.retries as i32)
        .bind(job.priority)
        .bind(job.execution_id.map(Uuid::from))
        .bind(job.process_instance_id.map(Uuid::from))
        .bind(job.process_definition_id.map(Uuid::from))
        .bind(job.deployment_id.map(Uuid::from))
        .bind(&job.exception_message)
        .bind(job.suspended)
        .bind(job.revision as i64)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                JobStoreError::AlreadyExists(job.id)
            }
            _ => map_sqlx_error("insert", e),
        })?;
        Ok(job)
    }

    async fn find_by_id_async(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_due_unlocked_async(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        order: AcquisitionOrder,
    ) -> Result<Vec<AcquirableJob>, JobStoreError> {
        let order_by = match order {
            AcquisitionOrder::Priority => "priority DESC, due_date ASC NULLS FIRST, id ASC",
            AcquisitionOrder::DueDate => "due_date ASC NULLS FIRST, id ASC",
        };
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE retries > 0 AND NOT suspended \
               AND (due_date IS NULL OR due_date <= $1) \
               AND (lock_owner IS NULL OR lock_expiration_time IS NULL OR lock_expiration_time <= $1) \
             ORDER BY {order_by} LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_due_unlocked", e))?;

        rows.iter()
            .map(|row| job_from_row(row).map(|job| AcquirableJob::from(&job)))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn try_lock_async(
        &self,
        id: JobId,
        owner: &str,
        lock_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let lease = chrono::Duration::from_std(lock_time)
            .map_err(|e| JobStoreError::Storage(format!("invalid lock time: {e}")))?;
        let result = sqlx::query(
            "UPDATE jobs SET lock_owner = $2, lock_expiration_time = $3, revision = revision + 1 \
             WHERE id = $1 AND retries > 0 AND NOT suspended \
               AND (due_date IS NULL OR due_date <= $4) \
               AND (lock_owner IS NULL OR lock_expiration_time IS NULL OR lock_expiration_time <= $4)",
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(now + lease)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_lock", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock_async(&self, id: JobId, owner: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET lock_owner = NULL, lock_expiration_time = NULL, revision = revision + 1 \
             WHERE id = $1 AND lock_owner = $2",
        )
        .bind(id.as_uuid())
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("unlock", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_async(&self, job: &Job) -> Result<Job, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET handler_type = $3, handler_configuration = $4, due_date = $5, \
               lock_owner = $6, lock_expiration_time = $7, retries = $8, priority = $9, \
               execution_id = $10, process_instance_id = $11, process_definition_id = $12, \
               deployment_id = $13, exception_message = $14, suspended = $15, \
               revision = revision + 1 \
             WHERE id = $1 AND revision = $2",
        )
        .bind(job.id.as_uuid())
        .bind(job.revision as i64)
        .bind(&job.handler_type)
        .bind(&job.handler_configuration)
        .bind(job.due_date)
        .bind(&job.lock_owner)
        .bind(job.lock_expiration_time)
        .bind(job.retries as i32)
        .bind(job.priority)
        .bind(job.execution_id.map(Uuid::from))
        .bind(job.process_instance_id.map(Uuid::from))
        .bind(job.process_definition_id.map(Uuid::from))
        .bind(job.deployment_id.map(Uuid::from))
        .bind(&job.exception_message)
        .bind(job.suspended)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 1 {
            let mut next = job.clone();
            next.revision += 1;
            return Ok(next);
        }
        match self.current_revision(job.id).await? {
            None => Err(JobStoreError::NotFound(job.id)),
            found => Err(JobStoreError::Conflict {
                id: job.id,
                expected: job.revision,
                found,
            }),
        }
    }

    async fn record_success_async(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("record_success", e))?;
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = $1 AND revision = $2")
            .bind(job.id.as_uuid())
            .bind(job.revision as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_success", e))?;
        if deleted.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("record_success", e))?;
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected: job.revision,
                found: self.current_revision(job.id).await?,
            });
        }
        sqlx::query("DELETE FROM job_incidents WHERE job_id = $1")
            .bind(job.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_success", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("record_success", e))
    }

    async fn delete_async(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        let row = sqlx::query(&format!(
            "DELETE FROM jobs WHERE id = $1 RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete", e))?;
        sqlx::query("DELETE FROM job_incidents WHERE job_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        tx.commit().await.map_err(|e| map_sqlx_error("delete", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_async(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE ($1::uuid IS NULL OR process_instance_id = $1) \
               AND ($2::text IS NULL OR handler_type = $2) \
               AND (NOT $3 OR retries = 0) \
               AND ($4::boolean IS NULL OR suspended = $4) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $5"
        ))
        .bind(filter.process_instance_id.map(Uuid::from))
        .bind(filter.handler_type.as_deref())
        .bind(filter.failed_only)
        .bind(filter.suspended)
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn delete_by_process_instance_async(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<usize, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("delete_by_process_instance", e))?;
        sqlx::query(
            "DELETE FROM job_incidents WHERE job_id IS NOT NULL AND process_instance_id = $1",
        )
        .bind(process_instance_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_by_process_instance", e))?;
        let deleted = sqlx::query("DELETE FROM jobs WHERE process_instance_id = $1")
            .bind(process_instance_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_by_process_instance", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("delete_by_process_instance", e))?;
        Ok(deleted.rows_affected() as usize)
    }

    async fn insert_incident_async(&self, incident: Incident) -> Result<(), JobStoreError> {
        sqlx::query(
            "INSERT INTO job_incidents \
             (id, incident_type, job_id, external_task_id, process_instance_id, execution_id, message, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(incident.id.as_uuid())
        .bind(&incident.incident_type)
        .bind(incident.job_id.map(Uuid::from))
        .bind(incident.external_task_id.map(Uuid::from))
        .bind(incident.process_instance_id.map(Uuid::from))
        .bind(incident.execution_id.map(Uuid::from))
        .bind(&incident.message)
        .bind(incident.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_incident", e))?;
        Ok(())
    }

    async fn resolve_incidents_async(&self, job_id: JobId) -> Result<usize, JobStoreError> {
        let deleted = sqlx::query("DELETE FROM job_incidents WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("resolve_incidents", e))?;
        Ok(deleted.rows_affected() as usize)
    }

    async fn list_incidents_async(
        &self,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> Result<Vec<Incident>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT id, incident_type, job_id, external_task_id, process_instance_id, execution_id, message, created_at \
             FROM job_incidents \
             WHERE ($1::uuid IS NULL OR process_instance_id = $1) \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(process_instance_id.map(Uuid::from))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_incidents", e))?;
        rows.iter().map(incident_from_row).collect()
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        self.block(self.insert_async(job))
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block(self.find_by_id_async(id))
    }

    fn find_due_unlocked(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        order: AcquisitionOrder,
    ) -> Result<Vec<AcquirableJob>, JobStoreError> {
        self.block(self.find_due_unlocked_async(now, limit, order))
    }

    fn try_lock(
        &self,
        id: JobId,
        owner: &str,
        lock_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        self.block(self.try_lock_async(id, owner, lock_time, now))
    }

    fn unlock(&self, id: JobId, owner: &str) -> Result<bool, JobStoreError> {
        self.block(self.unlock_async(id, owner))
    }

    fn update(&self, job: &Job) -> Result<Job, JobStoreError> {
        self.block(self.update_async(job))
    }

    fn record_failure(
        &self,
        job: &Job,
        retries: u32,
        exception_message: &str,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<Job, JobStoreError> {
        let mut next = job.clone();
        next.retries = retries;
        next.exception_message = Some(exception_message.to_string());
        if retries > 0 {
            next.reset_lock();
            if next_due.is_some() {
                next.due_date = next_due;
            }
        }
        self.update(&next)
    }

    fn record_success(&self, job: &Job) -> Result<(), JobStoreError> {
        self.block(self.record_success_async(job))
    }

    fn delete(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block(self.delete_async(id))
    }

    fn find_by_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.list(&JobFilter::for_process_instance(process_instance_id))
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        self.block(self.list_async(filter))
    }

    fn delete_by_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<usize, JobStoreError> {
        self.block(self.delete_by_process_instance_async(process_instance_id))
    }

    fn insert_incident(&self, incident: Incident) -> Result<(), JobStoreError> {
        self.block(self.insert_incident_async(incident))
    }

    fn resolve_incidents(&self, job_id: JobId) -> Result<usize, JobStoreError> {
        self.block(self.resolve_incidents_async(job_id))
    }

    fn list_incidents(
        &self,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> Result<Vec<Incident>, JobStoreError> {
        self.block(self.list_incidents_async(process_instance_id))
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let map = |e| map_sqlx_error("decode job", e);
    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(map)?),
        handler_type: row.try_get("handler_type").map_err(map)?,
        handler_configuration: row
            .try_get::<JsonValue, _>("handler_configuration")
            .map_err(map)?,
        due_date: row.try_get("due_date").map_err(map)?,
        lock_owner: row.try_get("lock_owner").map_err(map)?,
        lock_expiration_time: row.try_get("lock_expiration_time").map_err(map)?,
        retries: row.try_get::<i32, _>("retries").map_err(map)?.max(0) as u32,
        priority: row.try_get("priority").map_err(map)?,
        execution_id: row
            .try_get::<Option<Uuid>, _>("execution_id")
            .map_err(map)?
            .map(ExecutionId::from_uuid),
        process_instance_id: row
            .try_get::<Option<Uuid>, _>("process_instance_id")
            .map_err(map)?
            .map(ProcessInstanceId::from_uuid),
        process_definition_id: row
            .try_get::<Option<Uuid>, _>("process_definition_id")
            .map_err(map)?
            .map(ProcessDefinitionId::from_uuid),
        deployment_id: row
            .try_get::<Option<Uuid>, _>("deployment_id")
            .map_err(map)?
            .map(DeploymentId::from_uuid),
        exception_message: row.try_get("exception_message").map_err(map)?,
        suspended: row.try_get("suspended").map_err(map)?,
        revision: row.try_get::<i64, _>("revision").map_err(map)? as u64,
        created_at: row.try_get("created_at").map_err(map)?,
    })
}

fn incident_from_row(row: &PgRow) -> Result<Incident, JobStoreError> {
    let map = |e| map_sqlx_error("decode incident", e);
    Ok(Incident {
        id: IncidentId::from_uuid(row.try_get("id").map_err(map)?),
        incident_type: row.try_get("incident_type").map_err(map)?,
        job_id: row
            .try_get::<Option<Uuid>, _>("job_id")
            .map_err(map)?
            .map(JobId::from_uuid),
        external_task_id: row
            .try_get::<Option<Uuid>, _>("external_task_id")
            .map_err(map)?
            .map(stepflow_core::ExternalTaskId::from_uuid),
        process_instance_id: row
            .try_get::<Option<Uuid>, _>("process_instance_id")
            .map_err(map)?
            .map(ProcessInstanceId::from_uuid),
        execution_id: row
            .try_get::<Option<Uuid>, _>("execution_id")
            .map_err(map)?
            .map(ExecutionId::from_uuid),
        message: row.try_get("message").map_err(map)?,
        created_at: row.try_get("created_at").map_err(map)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {} (code {:?})",
            db_err.message(),
            db_err.code()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("{operation} failed: {other}")),
    }
}
