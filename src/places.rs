use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::config::PlacesConfig;
use crate::db::{crud, DbPool, NewPlace};
use crate::geocoder::Geocoder;
use crate::metrics::metrics;

const SWEEP_BATCH: i64 = 500;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStats {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub photos_processed: u64,
    pub assigned_existing: u64,
    pub places_created: u64,
    pub geocoder_requests: u64,
    pub geocoder_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverStatus {
    pub paused: bool,
    pub sweeping: bool,
    pub pending_photos: i64,
    pub last_sweep: SweepStats,
}

/// Clusters geotagged photos into named places: nearest existing place
/// within its radius first, reverse geocoding for everything else. Sweeps
/// are sequential; the geocoder's limiter enforces its own pacing on top.
pub struct PlaceResolver {
    db: DbPool,
    geocoder: Geocoder,
    config: PlacesConfig,
    paused: AtomicBool,
    sweeping: AtomicBool,
    run_now: Notify,
    last_sweep: RwLock<SweepStats>,
}

impl PlaceResolver {
    pub fn new(db: DbPool, geocoder: Geocoder, config: PlacesConfig) -> Self {
        Self {
            db,
            geocoder,
            config,
            paused: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            run_now: Notify::new(),
            last_sweep: RwLock::new(SweepStats::default()),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Place resolver paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Place resolver resumed");
    }

    pub fn run_now(&self) {
        self.run_now.notify_one();
    }

    pub async fn status(&self) -> ResolverStatus {
        let pending = crud::photos_pending_place(&self.db, SWEEP_BATCH)
            .await
            .map(|v| v.len() as i64)
            .unwrap_or(-1);

        ResolverStatus {
            paused: self.paused.load(Ordering::SeqCst),
            sweeping: self.sweeping.load(Ordering::SeqCst),
            pending_photos: pending,
            last_sweep: self.last_sweep.read().await.clone(),
        }
    }

    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let resolver = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(resolver.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = resolver.run_now.notified() => {
                        info!("Manual place sweep triggered");
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if resolver.paused.load(Ordering::SeqCst) {
                    continue;
                }
                resolver.sweep().await;
            }
        })
    }

    /// One pass over the pending set. Failures leave the photo unresolved
    /// for the next sweep; nothing here is fatal.
    pub async fn sweep(&self) {
        self.sweeping.store(true, Ordering::SeqCst);
        let mut stats = SweepStats {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let pending = match crud::photos_pending_place(&self.db, SWEEP_BATCH).await {
            Ok(pending) => pending,
            Err(e) => {
                error!("Could not load pending photos: {}", e);
                self.sweeping.store(false, Ordering::SeqCst);
                return;
            }
        };

        for photo in pending {
            if self.paused.load(Ordering::SeqCst) {
                break;
            }
            stats.photos_processed += 1;

            match self
                .resolve_one(&photo.id, photo.gps_lat, photo.gps_lon, &mut stats)
                .await
            {
                Ok(Resolution::Existing) => stats.assigned_existing += 1,
                Ok(Resolution::Created) => stats.places_created += 1,
                Err(e) => {
                    stats.geocoder_errors += 1;
                    metrics().geocoder_errors.inc();
                    warn!("Could not resolve place for {}: {}", photo.id, e);
                }
            }
        }

        stats.finished_at = Some(Utc::now());
        info!(
            "Place sweep done: {} photos, {} matched, {} places created, {} errors",
            stats.photos_processed,
            stats.assigned_existing,
            stats.places_created,
            stats.geocoder_errors
        );
        *self.last_sweep.write().await = stats;
        self.sweeping.store(false, Ordering::SeqCst);
    }

    async fn resolve_one(
        &self,
        photo_id: &str,
        lat: f64,
        lon: f64,
        stats: &mut SweepStats,
    ) -> anyhow::Result<Resolution> {
        if let Some(place_id) = crud::nearest_place_within_radius(&self.db, lat, lon).await? {
            crud::assign_place(&self.db, photo_id, place_id).await?;
            return Ok(Resolution::Existing);
        }

        stats.geocoder_requests += 1;
        let resolved = self.geocoder.reverse(lat, lon).await?;

        let place = NewPlace {
            name: resolved.name,
            country: resolved.country,
            city: resolved.city,
            address: resolved.address,
            lat,
            lon,
            radius_m: self.config.radius_m,
        };
        let place_id = crud::create_place(&self.db, &place).await?;
        crud::assign_place(&self.db, photo_id, place_id).await?;
        metrics().places_created.inc();

        let payload = serde_json::json!({ "id": place_id, "name": place.name });
        if let Err(e) = crud::insert_event(&self.db, "place_created", payload).await {
            warn!("Could not append place_created event: {}", e);
        }

        info!(
            "Created place '{}' ({}) at ({:.4}, {:.4})",
            place.name, place_id, lat, lon
        );
        Ok(Resolution::Created)
    }
}

enum Resolution {
    Existing,
    Created,
}
