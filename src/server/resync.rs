use std::sync::Arc;

use tracing::info;
use tracing::instrument;

use super::SyncWriter;
use crate::config::ScopedRetryConfig;
use crate::config::SyncConfig;
use crate::db::within_tx;
use crate::db::Database;
use crate::db::Filter;
use crate::db::TxOptions;
use crate::schema::Schema;
use crate::schema::SchemaManager;
use crate::sync::CoordinationStore;
use crate::Result;

/// Re-emits every synced resource and drains the event table into the
/// coordination store.
///
/// `db` must be event-logging so that each `resync` call queues an update
/// event. Drains run until one syncs nothing; the total is returned.
#[instrument(skip_all)]
pub async fn resync(
    db: Arc<dyn Database>,
    store: Arc<dyn CoordinationStore>,
    schemas: Arc<SchemaManager>,
    config: SyncConfig,
    retries: ScopedRetryConfig,
) -> Result<usize> {
    let synced: Vec<Arc<Schema>> = schemas
        .schemas()
        .filter(|s| !s.is_abstract && !s.metadata.nosync)
        .cloned()
        .collect();

    let queued = within_tx(db.as_ref(), &TxOptions::default(), retries, |tx| {
        let synced = synced.clone();
        Box::pin(async move {
            let mut queued = 0;
            for schema in &synced {
                let resources = tx.list(schema, &Filter::new(), None).await?;
                for resource in &resources {
                    tx.resync(resource).await?;
                }
                queued += resources.len();
            }
            Ok(queued)
        })
    })
    .await?;
    info!(queued, "resources queued for resync");

    let writer = SyncWriter::new(store, db, schemas, config, retries);
    let mut total = 0;
    loop {
        let synced = writer.sync_events().await?;
        if synced == 0 {
            break;
        }
        total += synced;
    }
    info!(total, "resync finished");
    Ok(total)
}
