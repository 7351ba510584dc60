//! Fire-and-forget per-request telemetry. A lost record never fails the
//! request that produced it.

use crate::sqlite_store::{AccessLogRecord, SqliteStore};

#[derive(Clone)]
pub struct AccessLogSink {
    store: SqliteStore,
}

impl AccessLogSink {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Appends one row off the request path.
    pub fn record(&self, record: AccessLogRecord) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.append_access_log(record).await {
                tracing::warn!(error = %err, "failed to append access log");
            }
        });
    }
}
