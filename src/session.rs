use std::io::Write;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use postgres::error::DbError;
use postgres::{Client, NoTls};

use crate::config::Profile;
use crate::error::MigrateError;

const APP_NAME: &str = "pgevodb";

/// Shared routing point for server NOTICE/WARNING messages.
///
/// The notice callback outlives any single step, so it writes into
/// whatever sink is currently installed; the executor installs its step
/// log for the duration of a step and removes it afterwards. With no sink
/// installed, notices go to the debug log.
#[derive(Clone, Default)]
pub struct NoticeSink {
    inner: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl NoticeSink {
    pub fn install(&self, writer: Box<dyn Write + Send>) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some(writer);
        }
    }

    pub fn remove(&self) {
        if let Ok(mut slot) = self.inner.lock() {
            *slot = None;
        }
    }

    fn forward(&self, notice: &DbError) {
        let line = format!("{}: {}", notice.severity(), notice.message());
        match self.inner.lock() {
            Ok(mut slot) => match slot.as_mut() {
                Some(writer) => {
                    let _ = writeln!(writer, "{line}");
                    let _ = writer.flush();
                }
                None => debug!("server notice: {line}"),
            },
            Err(_) => warn!("notice sink poisoned; dropping: {line}"),
        }
    }
}

/// One blocking PostgreSQL session, owned by the orchestrator for the
/// lifetime of a run. All engine SQL goes through this client; the server
/// releases session-scoped state (advisory locks included) when the
/// session ends, however it ends.
pub struct Session {
    client: Client,
    notices: NoticeSink,
}

impl Session {
    /// Connects using the profile's DSN and tags the session with an
    /// application name so it is identifiable in `pg_stat_activity`.
    pub fn connect(profile: &Profile) -> Result<Self, MigrateError> {
        let mut config: postgres::Config = profile.dsn.parse().map_err(|e| {
            MigrateError::ConfigError(format!("invalid DSN: {e}"))
        })?;
        config.application_name(APP_NAME);

        let notices = NoticeSink::default();
        let callback_sink = notices.clone();
        config.notice_callback(move |notice: DbError| {
            callback_sink.forward(&notice);
        });

        debug!("connecting to database as '{APP_NAME}'");
        let client = config.connect(NoTls)?;
        Ok(Session { client, notices })
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    pub fn notices(&self) -> NoticeSink {
        self.notices.clone()
    }

    /// Token for cancelling the statement currently executing on this
    /// session from another thread or process.
    #[allow(dead_code)]
    pub fn cancel_token(&self) -> postgres::CancelToken {
        self.client.cancel_token()
    }

    /// The server-side user this session authenticated as; recorded as
    /// the `applied_by` actor label.
    pub fn current_user(&mut self) -> Result<String, MigrateError> {
        let row = self.client.query_one("SELECT current_user::text", &[])?;
        Ok(row.get(0))
    }
}
