use serde_json::json;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use warp::{reject, Filter, Rejection, Reply};

use crate::db::{crud, DbPool};
use crate::processor::Processor;
use crate::quarantine::{Quarantine, QuarantineError};
use crate::queue::TaskQueue;
use crate::warp_helpers::{
    health_route, metrics_route, with_state, NotFoundError, ServiceError, ValidationError,
};

async fn status(
    processor: Arc<Processor>,
    queue: TaskQueue,
    db: DbPool,
) -> Result<impl Reply, Rejection> {
    let stats = queue.stats().await.map_err(|e| {
        reject::custom(ServiceError {
            message: format!("queue inspection failed: {}", e),
        })
    })?;

    let mut photos = serde_json::Map::new();
    for state in ["processing", "ready", "error"] {
        let count = crud::count_photos_by_status(&db, state)
            .await
            .map_err(|e| {
                reject::custom(ServiceError {
                    message: format!("catalog count failed: {}", e),
                })
            })?;
        photos.insert(state.to_string(), count.into());
    }

    let recent_failures = crud::last_failures(&db, 10).await.map_err(|e| {
        reject::custom(ServiceError {
            message: format!("failure history lookup failed: {}", e),
        })
    })?;

    Ok(warp::reply::json(&json!({
        "processor": processor.status(),
        "queue": stats,
        "queue_in_flight": stats.in_flight(),
        "photos": photos,
        "recent_failures": recent_failures,
    })))
}

async fn pause(processor: Arc<Processor>) -> Result<impl Reply, Infallible> {
    processor.pause();
    Ok(warp::reply::json(&json!({ "status": "paused" })))
}

async fn resume(processor: Arc<Processor>) -> Result<impl Reply, Infallible> {
    processor.resume();
    Ok(warp::reply::json(&json!({ "status": "resumed" })))
}

async fn list_failed(quarantine: Quarantine) -> Result<impl Reply, Rejection> {
    let failed = quarantine.list().map_err(|e| {
        reject::custom(ServiceError {
            message: format!("could not list quarantine: {}", e),
        })
    })?;
    Ok(warp::reply::json(&failed))
}

fn map_quarantine_error(e: QuarantineError) -> Rejection {
    match e {
        QuarantineError::NotFound(_) => reject::custom(NotFoundError),
        QuarantineError::InvalidPath(p) => reject::custom(ValidationError {
            message: format!("invalid path: {}", p),
        }),
        other => reject::custom(ServiceError {
            message: other.to_string(),
        }),
    }
}

async fn retry_failed(
    tail: warp::path::Tail,
    quarantine: Quarantine,
    uploads_root: PathBuf,
) -> Result<impl Reply, Rejection> {
    let restored = quarantine
        .retry(tail.as_str(), &uploads_root)
        .map_err(map_quarantine_error)?;

    Ok(warp::reply::json(&json!({
        "status": "requeued",
        "path": restored.to_string_lossy(),
    })))
}

async fn delete_failed(
    tail: warp::path::Tail,
    quarantine: Quarantine,
) -> Result<impl Reply, Rejection> {
    quarantine
        .delete(tail.as_str())
        .map_err(map_quarantine_error)?;
    Ok(warp::reply::json(&json!({ "status": "deleted" })))
}

pub fn routes(
    processor: Arc<Processor>,
    queue: TaskQueue,
    quarantine: Quarantine,
    uploads_root: PathBuf,
    db: DbPool,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let status_route = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(processor.clone()))
        .and(with_state(queue))
        .and(with_state(db))
        .and_then(status);

    let pause_route = warp::path("pause")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(processor.clone()))
        .and_then(pause);

    let resume_route = warp::path("resume")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(processor))
        .and_then(resume);

    let failed_route = warp::path("failed")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(quarantine.clone()))
        .and_then(list_failed);

    // The quarantine path contains the day directory, so these take the
    // whole remaining path, not a single segment.
    let retry_route = warp::path("retry")
        .and(warp::path::tail())
        .and(warp::post())
        .and(with_state(quarantine.clone()))
        .and(with_state(uploads_root))
        .and_then(retry_failed);

    let delete_route = warp::path("failed")
        .and(warp::path::tail())
        .and(warp::delete())
        .and(with_state(quarantine))
        .and_then(delete_failed);

    health_route()
        .or(metrics_route())
        .or(status_route)
        .or(pause_route)
        .or(resume_route)
        .or(failed_route)
        .or(retry_route)
        .or(delete_route)
}
