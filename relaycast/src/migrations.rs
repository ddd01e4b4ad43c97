use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::Script;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MIGRATION_LOCK_KEY: &str = "lock:relaycast:migration";
const MIGRATION_LOCK_TTL: u64 = 300;
const MIGRATION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MIGRATION_MAX_WAIT: Duration = Duration::from_secs(300);

/// Run database migrations, optionally using a Redis lock for multi-replica
/// deployments.
///
/// When `redis_url` is empty, migrations run directly. When set, only the
/// node holding the lock migrates; the others wait and then verify the
/// migrations are already applied before running them again.
pub async fn run_migrations(pool: &PgPool, redis_url: &str) -> Result<()> {
    info!("Running database migrations...");

    if redis_url.is_empty() {
        run_migrate(pool).await?;
    } else {
        run_migrations_with_lock(pool, redis_url).await?;
    }

    info!("Migrations completed");
    Ok(())
}

/// The single place that calls the migration macro.
async fn run_migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            anyhow::anyhow!("Migration failed: {e}")
        })
}

/// Compare the embedded migrations against `_sqlx_migrations`.
async fn migrations_already_applied(pool: &PgPool) -> bool {
    let migrator = sqlx::migrate!("../migrations");
    let applied: Vec<(i64,)> = match sqlx::query_as(
        "SELECT version FROM _sqlx_migrations ORDER BY version",
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(_) => return false, // table may not exist yet
    };

    let applied_versions: std::collections::HashSet<i64> =
        applied.into_iter().map(|(v,)| v).collect();

    migrator
        .migrations
        .iter()
        .all(|m| applied_versions.contains(&m.version))
}

/// Lock used to elect the node that runs migrations
trait LockBackend {
    async fn acquire(&self) -> redis::RedisResult<Option<String>>;

    async fn release(&self, lock_value: &str) -> redis::RedisResult<bool>;
}

/// Redis `SET NX EX` lock owned by one node at a time
struct MigrationLock {
    redis: ConnectionManager,
}

impl LockBackend for MigrationLock {
    async fn acquire(&self) -> redis::RedisResult<Option<String>> {
        let lock_value = nanoid::nanoid!(12);
        let mut conn = self.redis.clone();

        let result: Option<String> = redis::cmd("SET")
            .arg(MIGRATION_LOCK_KEY)
            .arg(&lock_value)
            .arg("NX")
            .arg("EX")
            .arg(MIGRATION_LOCK_TTL)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|_| lock_value))
    }

    /// Delete the key only if we still hold it
    async fn release(&self, lock_value: &str) -> redis::RedisResult<bool> {
        let script = Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
            "#,
        );

        let mut conn = self.redis.clone();
        let released: i32 = script
            .key(MIGRATION_LOCK_KEY)
            .arg(lock_value)
            .invoke_async(&mut conn)
            .await?;

        Ok(released == 1)
    }
}

async fn run_migrations_with_lock(pool: &PgPool, redis_url: &str) -> Result<()> {
    let redis_client = redis::Client::open(redis_url)
        .map_err(|e| anyhow::anyhow!("Failed to open Redis for migration lock: {e}"))?;
    let redis = redis_client
        .get_connection_manager()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Redis for migration lock: {e}"))?;
    let lock = MigrationLock { redis };

    match lock.acquire().await {
        Ok(Some(lock_value)) => {
            info!("Acquired migration lock, running migrations");
            let result = run_migrate(pool).await;
            release_lock(&lock, &lock_value).await;
            result
        }
        Ok(None) => wait_for_lock_and_migrate(pool, &lock).await,
        Err(e) => {
            warn!(
                "Failed to acquire migration lock (Redis error): {}, running migrations directly",
                e
            );
            run_migrate(pool).await
        }
    }
}

/// Outcome of waiting on a lock held by another node
#[derive(Debug)]
enum LockWait {
    Acquired(String),
    Unavailable(redis::RedisError),
}

/// Poll every `poll` until the lock is free, giving up after `max_wait`
async fn wait_for_lock<L: LockBackend>(
    lock: &L,
    poll: Duration,
    max_wait: Duration,
) -> Result<LockWait> {
    let max_attempts = (max_wait.as_millis() / poll.as_millis().max(1)).max(1);
    let mut attempts: u128 = 0;

    loop {
        tokio::time::sleep(poll).await;
        attempts += 1;

        match lock.acquire().await {
            Ok(Some(lock_value)) => return Ok(LockWait::Acquired(lock_value)),
            Ok(None) if attempts < max_attempts => continue,
            Ok(None) => {
                return Err(anyhow::anyhow!(
                    "Timed out waiting for migration lock after {}s",
                    (poll * u32::try_from(attempts).unwrap_or(u32::MAX)).as_secs()
                ));
            }
            Err(e) => return Ok(LockWait::Unavailable(e)),
        }
    }
}

/// Another node holds the lock. Wait for it, then check whether there is
/// anything left to migrate.
async fn wait_for_lock_and_migrate(pool: &PgPool, lock: &MigrationLock) -> Result<()> {
    info!("Another node is running migrations, waiting...");

    match wait_for_lock(lock, MIGRATION_POLL_INTERVAL, MIGRATION_MAX_WAIT).await? {
        LockWait::Acquired(lock_value) => {
            if migrations_already_applied(pool).await {
                info!("Migrations already applied by another node, skipping");
                release_lock(lock, &lock_value).await;
                return Ok(());
            }

            info!("Migration lock acquired after waiting, running migrations");
            let result = run_migrate(pool).await;
            release_lock(lock, &lock_value).await;
            result
        }
        LockWait::Unavailable(e) => {
            warn!(
                "Redis error while waiting for migration lock: {}, running migrations directly",
                e
            );
            run_migrate(pool).await
        }
    }
}

/// Best-effort release; migrations may already have succeeded.
async fn release_lock<L: LockBackend>(lock: &L, lock_value: &str) {
    match lock.release(lock_value).await {
        Ok(true) => debug!("Migration lock released"),
        Ok(false) => warn!("Migration lock expired before release"),
        Err(e) => warn!("Failed to release migration lock: {}", e),
    }
}
