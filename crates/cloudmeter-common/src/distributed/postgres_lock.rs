use sqlx::PgConnection;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Lock timeout after {0} seconds")]
    Timeout(u64),
}

/// A unique key identifying a specific advisory lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    pub const fn new(key: i64) -> Self {
        Self(key)
    }

    /// Derive a key from a namespace and a row name.
    ///
    /// The derivation is stable across processes and releases, so every
    /// writer contending for the same logical row computes the same key.
    pub fn for_name(namespace: &str, name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(namespace.as_bytes());
        hasher.update(&[0]);
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        Self(i64::from_be_bytes(prefix))
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Transaction-scoped PostgreSQL advisory locks.
///
/// Locks taken here are held until the surrounding transaction commits or
/// rolls back; there is no explicit release. The connection passed in must
/// belong to an open transaction, otherwise the lock is dropped as soon as
/// the implicit single-statement transaction ends.
pub struct XactLock;

impl XactLock {
    /// Wait until the lock is granted.
    pub async fn acquire(conn: &mut PgConnection, key: LockKey) -> Result<(), LockError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key.value())
            .execute(&mut *conn)
            .await?;

        debug!("Acquired transaction advisory lock {}", key);
        Ok(())
    }

    /// Wait for the lock, giving up after `timeout_secs`.
    ///
    /// The timeout only covers the lock wait. The transaction's previous
    /// `lock_timeout` is restored once the lock is granted, so later row
    /// locks in the same transaction wait as they did before.
    pub async fn acquire_with_timeout(
        conn: &mut PgConnection,
        key: LockKey,
        timeout_secs: u64,
    ) -> Result<(), LockError> {
        let previous: String = sqlx::query_scalar("SELECT current_setting('lock_timeout')")
            .fetch_one(&mut *conn)
            .await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}s", timeout_secs))
            .execute(&mut *conn)
            .await?;

        match Self::acquire(conn, key).await {
            Err(LockError::Database(sqlx::Error::Database(e)))
                if e.code().as_deref() == Some("55P03") =>
            {
                return Err(LockError::Timeout(timeout_secs));
            }
            other => other?,
        }

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(previous)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_is_stable() {
        let a = LockKey::for_name("account", "tenant-a");
        let b = LockKey::for_name("account", "tenant-a");
        assert_eq!(a, b);
    }

    #[test]
    fn test_namespace_separates_keys() {
        let account = LockKey::for_name("account", "shared");
        let cost_center = LockKey::for_name("cost_center", "shared");
        assert_ne!(account, cost_center);

        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(LockKey::for_name("ab", "c"), LockKey::for_name("a", "bc"));
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        assert_eq!(LockKey::new(0xB177A0).to_string(), "0x0000000000B177A0");
        assert_eq!(LockKey::new(-1).to_string(), "0xFFFFFFFFFFFFFFFF");
    }
}
