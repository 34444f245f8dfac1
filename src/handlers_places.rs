use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

use crate::places::PlaceResolver;
use crate::warp_helpers::{health_route, metrics_route, with_state};

async fn status(resolver: Arc<PlaceResolver>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&resolver.status().await))
}

async fn run(resolver: Arc<PlaceResolver>) -> Result<impl Reply, Infallible> {
    resolver.run_now();
    Ok(warp::reply::json(&json!({ "status": "sweep scheduled" })))
}

async fn pause(resolver: Arc<PlaceResolver>) -> Result<impl Reply, Infallible> {
    resolver.pause();
    Ok(warp::reply::json(&json!({ "status": "paused" })))
}

async fn resume(resolver: Arc<PlaceResolver>) -> Result<impl Reply, Infallible> {
    resolver.resume();
    Ok(warp::reply::json(&json!({ "status": "resumed" })))
}

pub fn routes(
    resolver: Arc<PlaceResolver>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let status_route = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(resolver.clone()))
        .and_then(status);

    let run_route = warp::path("run")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(resolver.clone()))
        .and_then(run);

    let pause_route = warp::path("pause")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(resolver.clone()))
        .and_then(pause);

    let resume_route = warp::path("resume")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(resolver))
        .and_then(resume);

    health_route()
        .or(metrics_route())
        .or(status_route)
        .or(run_route)
        .or(pause_route)
        .or(resume_route)
}
