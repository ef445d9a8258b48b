//! Work persistence
//!
//! Works are saved whole. `save_work` is a compare-and-swap on the work's
//! `version`: a write based on a stale read is rejected with
//! `ConcurrentModification` and the stored document is left as it was.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::work::{ClassSession, UserContact, Work};

#[async_trait]
pub trait WorkStore: Send + Sync {
    async fn get_work(&self, work_id: Uuid) -> BillingResult<Work>;

    async fn insert_work(&self, work: &Work) -> BillingResult<()>;

    /// Persist `work` if nobody else saved it since it was read. Returns the
    /// work with its bumped version.
    async fn save_work(&self, work: &Work) -> BillingResult<Work>;

    /// Subscribed works whose current term is due at or before `now`
    async fn find_due_subscriptions(&self, now: OffsetDateTime) -> BillingResult<Vec<Work>>;

    async fn list_works(&self) -> BillingResult<Vec<Work>>;

    async fn get_user(&self, user_id: Uuid) -> BillingResult<UserContact>;

    /// Class window for a service, if one has been scheduled
    async fn open_class_session(&self, service: &str) -> BillingResult<Option<ClassSession>>;
}

/// Create the Postgres pool used by the api and worker binaries
pub async fn create_pool(database_url: &str, max_connections: u32) -> BillingResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(FromRow)]
struct WorkRow {
    version: i64,
    document: Json<Work>,
}

impl WorkRow {
    fn into_work(self) -> Work {
        let mut work = self.document.0;
        work.version = self.version;
        work
    }
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    name: String,
}

#[derive(FromRow)]
struct ClassSessionRow {
    service: String,
    come_in: bool,
    join_url: String,
    password: String,
}

/// Postgres-backed store keeping each work as a JSONB document
#[derive(Clone)]
pub struct PgWorkStore {
    pool: PgPool,
}

impl PgWorkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> BillingResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))
    }
}

#[async_trait]
impl WorkStore for PgWorkStore {
    async fn get_work(&self, work_id: Uuid) -> BillingResult<Work> {
        let row: Option<WorkRow> =
            sqlx::query_as("SELECT version, document FROM works WHERE id = $1")
                .bind(work_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(WorkRow::into_work)
            .ok_or_else(|| BillingError::NotFound(format!("Work {} not found", work_id)))
    }

    async fn insert_work(&self, work: &Work) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO works (id, user_id, status, next_payment, version, document, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(work.id)
        .bind(work.user_id)
        .bind(work.status.as_str())
        .bind(work.next_payment_due())
        .bind(work.version)
        .bind(Json(work))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_work(&self, work: &Work) -> BillingResult<Work> {
        let mut saved = work.clone();
        saved.version = work.version + 1;

        let result = sqlx::query(
            r#"
            UPDATE works
            SET status = $2,
                next_payment = $3,
                version = $4,
                document = $6,
                updated_at = NOW()
            WHERE id = $1 AND version = $5
            "#,
        )
        .bind(work.id)
        .bind(saved.status.as_str())
        .bind(saved.next_payment_due())
        .bind(saved.version)
        .bind(work.version)
        .bind(Json(&saved))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM works WHERE id = $1")
                .bind(work.id)
                .fetch_optional(&self.pool)
                .await?;

            return Err(match exists {
                Some(_) => BillingError::ConcurrentModification,
                None => BillingError::NotFound(format!("Work {} not found", work.id)),
            });
        }

        tracing::debug!(
            work_id = %work.id,
            status = %saved.status,
            version = saved.version,
            "Saved work"
        );

        Ok(saved)
    }

    async fn find_due_subscriptions(&self, now: OffsetDateTime) -> BillingResult<Vec<Work>> {
        let rows: Vec<WorkRow> = sqlx::query_as(
            r#"
            SELECT version, document
            FROM works
            WHERE status = 'Subscribed'
              AND next_payment IS NOT NULL
              AND next_payment <= $1
            ORDER BY next_payment
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WorkRow::into_work).collect())
    }

    async fn list_works(&self) -> BillingResult<Vec<Work>> {
        let rows: Vec<WorkRow> =
            sqlx::query_as("SELECT version, document FROM works ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(WorkRow::into_work).collect())
    }

    async fn get_user(&self, user_id: Uuid) -> BillingResult<UserContact> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, email, name FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| UserContact {
            id: r.id,
            email: r.email,
            name: r.name,
        })
        .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))
    }

    async fn open_class_session(&self, service: &str) -> BillingResult<Option<ClassSession>> {
        let row: Option<ClassSessionRow> = sqlx::query_as(
            r#"
            SELECT service, come_in, join_url, password
            FROM class_sessions
            WHERE service = $1
            "#,
        )
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ClassSession {
            service: r.service,
            come_in: r.come_in,
            join_url: r.join_url,
            password: r.password,
        }))
    }
}
