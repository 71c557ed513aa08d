// Postgres-backed user and order stores (sqlx)
//
// Expected columns:
//   users(id BIGINT PK, username TEXT, nickname TEXT, avatar_url TEXT, trust_level INT,
//         is_active BOOL, balance BIGINT, last_login_at TIMESTAMPTZ NULL,
//         created_at TIMESTAMPTZ, updated_at TIMESTAMPTZ)
//   orders(id BIGINT PK, status TEXT, expires_at TIMESTAMPTZ, updated_at TIMESTAMPTZ, ...)
//
// `users.username` must not carry a unique index: a recycled handle is briefly
// held by two rows until the stale holder logs in under its new name.

use crate::auth::user_store::{AccountCreator, UserStore};
use crate::core::errors::ReconcileError;
use crate::core::models::{Claims, OrderStatus, User};
use crate::state::order_store::OrderStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::{debug, info};

const USER_COLUMNS: &str = "id, username, nickname, avatar_url, trust_level, is_active, balance, \
                            last_login_at, created_at, updated_at";

/// Database row structure for users
#[derive(FromRow)]
struct UserRow {
    id: i64,
    username: String,
    nickname: String,
    avatar_url: String,
    trust_level: i32,
    is_active: bool,
    balance: i64,
    last_login_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = ReconcileError;

    fn try_from(r: UserRow) -> Result<Self, Self::Error> {
        let id = u64::try_from(r.id)
            .map_err(|_| ReconcileError::StorageError(format!("Negative user id {}", r.id)))?;
        Ok(User {
            id,
            username: r.username,
            nickname: r.nickname,
            avatar_url: r.avatar_url,
            trust_level: r.trust_level,
            is_active: r.is_active,
            balance: r.balance,
            last_login_at: r.last_login_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

fn db_id(id: u64) -> Result<i64, ReconcileError> {
    i64::try_from(id).map_err(|_| ReconcileError::StorageError(format!("Id {} out of range", id)))
}

/// Open a connection pool
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, ReconcileError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| ReconcileError::StorageError(format!("Failed to connect to database: {}", e)))?;
    info!(max_connections, "Database pool initialized");
    Ok(pool)
}

/// Postgres user store; also the account-creation hook
pub struct DbUserStore {
    db_pool: PgPool,
    initial_credit: i64,
}

impl DbUserStore {
    pub fn new(db_pool: PgPool, initial_credit: i64) -> Self {
        Self {
            db_pool,
            initial_credit,
        }
    }
}

#[async_trait]
impl UserStore for DbUserStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, ReconcileError> {
        // Most recently updated holder wins while a recycled handle is shared
        let query = format!(
            "SELECT {} FROM users WHERE username = $1 ORDER BY updated_at DESC LIMIT 1",
            USER_COLUMNS
        );
        sqlx::query_as::<_, UserRow>(&query)
            .bind(username)
            .fetch_optional(&self.db_pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn find_by_id(&self, id: u64) -> Result<Option<User>, ReconcileError> {
        let query = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        sqlx::query_as::<_, UserRow>(&query)
            .bind(db_id(id)?)
            .fetch_optional(&self.db_pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn save(&self, user: &User) -> Result<(), ReconcileError> {
        let result = sqlx::query(
            "UPDATE users
             SET username = $2, nickname = $3, avatar_url = $4, trust_level = $5,
                 is_active = $6, last_login_at = $7, updated_at = $8
             WHERE id = $1",
        )
        .bind(db_id(user.id)?)
        .bind(&user.username)
        .bind(&user.nickname)
        .bind(&user.avatar_url)
        .bind(user.trust_level)
        .bind(user.is_active)
        .bind(user.last_login_at)
        .bind(user.updated_at)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReconcileError::StorageError(format!(
                "User {} not found on save",
                user.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountCreator for DbUserStore {
    async fn create_with_initial_grant(&self, claims: &Claims) -> Result<User, ReconcileError> {
        let user = User::from_claims(claims, self.initial_credit, Utc::now());

        sqlx::query(
            "INSERT INTO users (id, username, nickname, avatar_url, trust_level, is_active,
                                balance, last_login_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(db_id(user.id)?)
        .bind(&user.username)
        .bind(&user.nickname)
        .bind(&user.avatar_url)
        .bind(user.trust_level)
        .bind(user.is_active)
        .bind(user.balance)
        .bind(user.last_login_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.db_pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                ReconcileError::StorageError(format!("User {} already exists", user.id))
            }
            other => other.into(),
        })?;

        debug!(user_id = user.id, balance = user.balance, "Inserted user with initial grant");
        Ok(user)
    }
}

/// Postgres order store. Status writes are single conditional UPDATEs.
pub struct DbOrderStore {
    db_pool: PgPool,
}

impl DbOrderStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl OrderStore for DbOrderStore {
    async fn update_status_if(
        &self,
        order_id: u64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<u64, ReconcileError> {
        // No row can carry an id beyond BIGINT
        let Ok(id) = i64::try_from(order_id) else {
            return Ok(0);
        };

        let result = sqlx::query(
            "UPDATE orders SET status = $3, updated_at = NOW()
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64, ReconcileError> {
        let result = sqlx::query(
            "UPDATE orders SET status = $2, updated_at = NOW()
             WHERE status = $1 AND expires_at <= $3",
        )
        .bind(OrderStatus::Pending.as_str())
        .bind(OrderStatus::Expired.as_str())
        .bind(now)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected())
    }
}
