use log::{debug, warn};

use crate::error::MigrateError;
use crate::session::Session;

/// Serialises migration executors across processes with a session-scoped
/// PostgreSQL advisory lock.
///
/// The lock is taken once per orchestrator run and held across planning
/// and every step, so a competing process can never interleave with a
/// half-executed plan. If this process dies while holding the lock, the
/// server releases it with the session.
pub struct LockManager {
    key: i64,
}

impl LockManager {
    pub fn new(key: i64) -> Self {
        LockManager { key }
    }

    /// Runs `f` under the advisory lock, releasing it on every exit path.
    ///
    /// A lock already held elsewhere fails fast with `LockBusy` before
    /// `f` runs; nothing is retried.
    pub fn with_lock<T>(
        &self,
        session: &mut Session,
        f: impl FnOnce(&mut Session) -> Result<T, MigrateError>,
    ) -> Result<T, MigrateError> {
        let row = session
            .client_mut()
            .query_one("SELECT pg_try_advisory_lock($1)", &[&self.key])?;
        let acquired: bool = row.get(0);
        if !acquired {
            return Err(MigrateError::LockBusy);
        }
        debug!("acquired advisory lock {}", self.key);

        let result = f(session);

        match session
            .client_mut()
            .query_one("SELECT pg_advisory_unlock($1)", &[&self.key])
        {
            Ok(row) => {
                let released: bool = row.get(0);
                if !released {
                    warn!("advisory lock {} was not held at release", self.key);
                } else {
                    debug!("released advisory lock {}", self.key);
                }
            }
            // The session may already be gone (e.g. the error we are
            // propagating was a connection failure); the server releases
            // the lock with the session in that case.
            Err(e) => warn!("failed to release advisory lock {}: {}", self.key, e),
        }

        result
    }
}
