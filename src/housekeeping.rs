use chrono::{Duration as ChronoDuration, Utc};
use clokwerk::{Scheduler, TimeUnits};
use log::{error, info, warn};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::db::{crud, DbPool};
use crate::metrics::metrics;
use crate::object_store::ObjectStore;

const TRASH_RETENTION_DAYS: i64 = 30;

/// Hourly trash purge: photos soft-deleted more than 30 days ago lose
/// their derivatives and then their catalog row (memberships cascade).
#[derive(Clone)]
pub struct Housekeeper {
    db: DbPool,
    store: ObjectStore,
}

impl Housekeeper {
    pub fn new(db: DbPool, store: ObjectStore) -> Self {
        Self { db, store }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let mut scheduler = Scheduler::new();

        let housekeeper = self.clone();
        scheduler.every(1.hours()).run(move || {
            let housekeeper = housekeeper.clone();
            match tokio::runtime::Runtime::new() {
                Ok(rt) => rt.block_on(async move {
                    if let Err(e) = housekeeper.purge_expired_trash().await {
                        error!("Trash purge failed: {}", e);
                    }
                }),
                Err(e) => error!("Could not start purge runtime: {}", e),
            }
        });

        let handle = thread::spawn(move || loop {
            scheduler.run_pending();
            thread::sleep(Duration::from_secs(60));
        });

        info!("Housekeeping started: trash purge every hour");
        handle
    }

    /// One purge pass. Files go first; if the row delete then fails the
    /// next pass simply finds nothing left to remove on disk.
    pub async fn purge_expired_trash(&self) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - ChronoDuration::days(TRASH_RETENTION_DAYS);
        let expired = crud::list_expired_trash(&self.db, cutoff).await?;

        if expired.is_empty() {
            return Ok(0);
        }
        info!("Purging {} photo(s) from trash", expired.len());

        let mut purged = 0u64;
        for photo in expired {
            if let Err(e) = self.store.remove_derivatives(&photo.id) {
                warn!("Could not remove derivatives for {}: {}", photo.id, e);
            }

            crud::purge_photo(&self.db, &photo.id).await?;
            purged += 1;
            metrics().trash_purged.inc();

            let payload = serde_json::json!({ "id": photo.id, "purged": true });
            if let Err(e) = crud::insert_event(&self.db, "photo_deleted", payload).await {
                warn!("Could not append photo_deleted event for {}: {}", photo.id, e);
            }
        }

        Ok(purged)
    }
}
