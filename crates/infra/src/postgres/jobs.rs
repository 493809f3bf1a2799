//! Queue tables and activity streams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection};
use tracing::{debug, instrument};

use marketsync_core::{JobId, JobState};

use super::{PgStore, is_unique_violation, map_sqlx_error};
use crate::activity::{ActivityEntry, ActivityLog, ActivityStream};
use crate::jobs::{
    ClaimOrder, ClaimPolicy, DuplicateRule, JobRecord, JobRow, JobScope, JobStore, NewJob,
    Pipeline, StatusCounts, StoreError,
};

pub(super) const JOB_COLUMNS: &str = "id, user_id, marketplace_id, natural_key, status, attempts, \
     run_after, started_at, finished_at, last_error, details, created_at, updated_at";

fn status_texts<S: JobState>(statuses: &[S]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

pub(super) async fn fetch_job<P: Pipeline>(
    conn: &mut PgConnection,
    id: JobId,
    for_update: bool,
) -> Result<Option<JobRecord<P>>, StoreError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM {} WHERE id = $1{}",
        P::TABLE,
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("fetch_job", e))?
        .map(JobRow::decode::<P>)
        .transpose()
}

pub(super) async fn update_job<P: Pipeline>(
    conn: &mut PgConnection,
    job: &JobRecord<P>,
) -> Result<(), StoreError> {
    let row = JobRow::encode(job)?;
    let sql = format!(
        "UPDATE {} SET status = $2, attempts = $3, run_after = $4, started_at = $5, \
         finished_at = $6, last_error = $7, details = $8, updated_at = $9 WHERE id = $1",
        P::TABLE
    );
    let result = sqlx::query(&sql)
        .bind(row.id)
        .bind(&row.status)
        .bind(row.attempts)
        .bind(row.run_after)
        .bind(row.started_at)
        .bind(row.finished_at)
        .bind(&row.last_error)
        .bind(&row.details)
        .bind(row.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            table: P::TABLE,
            id: job.id,
        });
    }
    Ok(())
}

/// Existence check plus insert. The check is best-effort; a partial unique
/// index, where the schema has one, turns a lost race into `Ok(None)` too.
pub(super) async fn insert_job<P: Pipeline>(
    conn: &mut PgConnection,
    job: NewJob<P>,
    rule: &DuplicateRule<P::Status>,
    now: DateTime<Utc>,
) -> Result<Option<JobRecord<P>>, StoreError> {
    let sql = format!(
        "SELECT status FROM {} WHERE user_id = $1 AND marketplace_id = $2 AND natural_key = $3",
        P::TABLE
    );
    let existing: Vec<String> = sqlx::query_scalar(&sql)
        .bind(job.user_id.as_uuid())
        .bind(job.marketplace_id.as_uuid())
        .bind(&job.natural_key)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
    for status in existing {
        if rule.blocks(status.parse::<P::Status>()?) {
            return Ok(None);
        }
    }

    let details = crate::jobs::store::encode_details::<P>(&job.details)?;
    let sql = format!(
        "INSERT INTO {} (user_id, marketplace_id, natural_key, status, attempts, run_after, \
         details, created_at, updated_at) VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $7) \
         RETURNING {JOB_COLUMNS}",
        P::TABLE
    );
    let inserted = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job.user_id.as_uuid())
        .bind(job.marketplace_id.as_uuid())
        .bind(&job.natural_key)
        .bind(job.status.as_str())
        .bind(job.run_after)
        .bind(&details)
        .bind(now)
        .fetch_one(&mut *conn)
        .await;

    match inserted {
        Ok(row) => Ok(Some(row.decode::<P>()?)),
        Err(e) if is_unique_violation(&e) => Ok(None),
        Err(e) => Err(map_sqlx_error("insert_job", e)),
    }
}

async fn last_activity(
    conn: &mut PgConnection,
    stream: ActivityStream,
    job_id: JobId,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    let sql = format!("SELECT MAX(created_at) FROM {} WHERE job_id = $1", stream.table());
    sqlx::query_scalar::<_, Option<DateTime<Utc>>>(&sql)
        .bind(job_id.get())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("last_activity", e))
}

/// SQL rendition of [`ClaimPolicy::admits`] for table `P::TABLE`.
fn claim_sql<P: Pipeline>(policy: &ClaimPolicy<P::Status>) -> String {
    let cooldown = match P::ACTIVITY {
        Some(stream) => format!(
            "GREATEST(j.updated_at, COALESCE((SELECT MAX(a.created_at) FROM {} a \
             WHERE a.job_id = j.id), j.updated_at))",
            stream.table()
        ),
        None => "j.updated_at".to_string(),
    };
    let order = match policy.order {
        ClaimOrder::Id => "j.id ASC",
        ClaimOrder::RunAfter => "j.run_after ASC NULLS FIRST, j.id ASC",
    };
    format!(
        "SELECT {JOB_COLUMNS} FROM {table} j
         WHERE (j.status = ANY($1) OR (j.status = $2 AND j.updated_at <= $3))
           AND (j.run_after IS NULL OR j.run_after <= $4)
           AND ($5::int4 IS NULL OR j.attempts < $5 OR j.status = ANY($6))
           AND ($7::uuid IS NULL OR j.user_id = $7)
           AND ($8::uuid IS NULL OR j.marketplace_id = $8)
           AND ($9::timestamptz IS NULL OR {cooldown} <= $9)
         ORDER BY {order}
         LIMIT 1
         FOR UPDATE OF j SKIP LOCKED",
        table = P::TABLE,
    )
}

#[async_trait]
impl<P: Pipeline> JobStore<P> for PgStore {
    #[instrument(skip_all, fields(table = P::TABLE, operation = "insert", key = %job.natural_key), err)]
    async fn insert(
        &self,
        job: NewJob<P>,
        rule: DuplicateRule<P::Status>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord<P>>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let inserted = insert_job::<P>(&mut tx, job, &rule, now).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(inserted)
    }

    #[instrument(skip_all, fields(table = P::TABLE, operation = "get", job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord<P>>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        fetch_job::<P>(&mut conn, id, false).await
    }

    #[instrument(skip_all, fields(table = P::TABLE, operation = "claim"), err)]
    async fn claim(
        &self,
        policy: &ClaimPolicy<P::Status>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord<P>>, StoreError> {
        let (user_id, marketplace_id) = policy.scope.parts();
        let max_attempts = policy
            .max_attempts
            .map(|m| i32::try_from(m).unwrap_or(i32::MAX));
        let reclaim_status = policy.reclaim.map(|r| r.status.as_str().to_string());
        let reclaim_before = policy.reclaim.map(|r| now - r.after);
        let cooldown_before = policy.cooldown.map(|c| now - c);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = claim_sql::<P>(policy);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(status_texts(&policy.eligible))
            .bind(reclaim_status)
            .bind(reclaim_before)
            .bind(now)
            .bind(max_attempts)
            .bind(status_texts(&policy.cap_exempt_statuses()))
            .bind(user_id.map(|u| *u.as_uuid()))
            .bind(marketplace_id.map(|m| *m.as_uuid()))
            .bind(cooldown_before)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_scan", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(None);
        };
        let mut job = row.decode::<P>()?;

        let activity = match P::ACTIVITY {
            Some(stream) => last_activity(&mut tx, stream, job.id).await?,
            None => None,
        };
        if !policy.admits(&job, activity, now) {
            debug!(job_id = %job.id, "candidate failed re-check after lock");
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(None);
        }

        policy.apply(&mut job, now);
        update_job::<P>(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(job))
    }

    #[instrument(skip_all, fields(table = P::TABLE, operation = "save", job_id = %job.id), err)]
    async fn save(&self, job: &JobRecord<P>) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        update_job::<P>(&mut conn, job).await
    }

    #[instrument(skip_all, fields(table = P::TABLE, operation = "latest"), err)]
    async fn latest(
        &self,
        scope: JobScope,
        statuses: &[P::Status],
    ) -> Result<Option<JobRecord<P>>, StoreError> {
        let (user_id, marketplace_id) = scope.parts();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {}
             WHERE ($1::uuid IS NULL OR user_id = $1)
               AND ($2::uuid IS NULL OR marketplace_id = $2)
               AND (cardinality($3::text[]) = 0 OR status = ANY($3))
             ORDER BY id DESC
             LIMIT 1",
            P::TABLE
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(user_id.map(|u| *u.as_uuid()))
            .bind(marketplace_id.map(|m| *m.as_uuid()))
            .bind(status_texts(statuses))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest", e))?
            .map(JobRow::decode::<P>)
            .transpose()
    }

    #[instrument(skip_all, fields(table = P::TABLE, operation = "list", limit = limit), err)]
    async fn list(
        &self,
        scope: JobScope,
        statuses: &[P::Status],
        limit: usize,
    ) -> Result<Vec<JobRecord<P>>, StoreError> {
        let (user_id, marketplace_id) = scope.parts();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {}
             WHERE ($1::uuid IS NULL OR user_id = $1)
               AND ($2::uuid IS NULL OR marketplace_id = $2)
               AND (cardinality($3::text[]) = 0 OR status = ANY($3))
             ORDER BY id ASC
             LIMIT $4",
            P::TABLE
        );
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(user_id.map(|u| *u.as_uuid()))
            .bind(marketplace_id.map(|m| *m.as_uuid()))
            .bind(status_texts(statuses))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?
            .into_iter()
            .map(JobRow::decode::<P>)
            .collect()
    }

    #[instrument(skip_all, fields(table = P::TABLE, operation = "counts"), err)]
    async fn counts(&self, scope: JobScope) -> Result<StatusCounts, StoreError> {
        let (user_id, marketplace_id) = scope.parts();
        let sql = format!(
            "SELECT status, COUNT(*) FROM {}
             WHERE ($1::uuid IS NULL OR user_id = $1)
               AND ($2::uuid IS NULL OR marketplace_id = $2)
             GROUP BY status",
            P::TABLE
        );
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .bind(user_id.map(|u| *u.as_uuid()))
            .bind(marketplace_id.map(|m| *m.as_uuid()))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            // Unknown values surface here rather than being counted silently.
            let status = status.parse::<P::Status>()?;
            counts.add(status.as_str(), u64::try_from(n).unwrap_or_default());
        }
        Ok(counts)
    }
}

#[derive(Debug, FromRow)]
struct ActivityRow {
    id: i64,
    job_id: i64,
    step: String,
    payload: JsonValue,
    created_at: DateTime<Utc>,
}

impl From<ActivityRow> for ActivityEntry {
    fn from(row: ActivityRow) -> Self {
        Self {
            id: row.id,
            job_id: JobId::new(row.job_id),
            step: row.step,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl ActivityLog for PgStore {
    #[instrument(skip(self, payload), fields(table = stream.table(), job_id = %job_id), err)]
    async fn append(
        &self,
        stream: ActivityStream,
        job_id: JobId,
        step: &str,
        payload: JsonValue,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (job_id, step, payload, created_at) VALUES ($1, $2, $3, $4)",
            stream.table()
        );
        sqlx::query(&sql)
            .bind(job_id.get())
            .bind(step)
            .bind(&payload)
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("append_activity", e))?;
        Ok(())
    }

    async fn last_activity_at(
        &self,
        stream: ActivityStream,
        job_id: JobId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        last_activity(&mut conn, stream, job_id).await
    }

    async fn latest_step(
        &self,
        stream: ActivityStream,
        job_id: JobId,
        step: &str,
    ) -> Result<Option<ActivityEntry>, StoreError> {
        let sql = format!(
            "SELECT id, job_id, step, payload, created_at FROM {}
             WHERE job_id = $1 AND step = $2
             ORDER BY id DESC
             LIMIT 1",
            stream.table()
        );
        let row = sqlx::query_as::<_, ActivityRow>(&sql)
            .bind(job_id.get())
            .bind(step)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_step", e))?;
        Ok(row.map(Into::into))
    }

    async fn history(
        &self,
        stream: ActivityStream,
        job_id: JobId,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        let sql = format!(
            "SELECT id, job_id, step, payload, created_at FROM {} WHERE job_id = $1 ORDER BY id ASC",
            stream.table()
        );
        let rows = sqlx::query_as::<_, ActivityRow>(&sql)
            .bind(job_id.get())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("history", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
