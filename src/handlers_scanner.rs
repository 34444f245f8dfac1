use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

use crate::scanner::Scanner;
use crate::warp_helpers::{health_route, metrics_route, with_state};

async fn status(scanner: Arc<Scanner>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&scanner.status().await))
}

async fn rescan(scanner: Arc<Scanner>) -> Result<impl Reply, Infallible> {
    scanner.rescan_now();
    Ok(warp::reply::json(&json!({ "status": "rescan scheduled" })))
}

pub fn routes(
    scanner: Arc<Scanner>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let status_route = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(scanner.clone()))
        .and_then(status);

    let rescan_route = warp::path("rescan")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(scanner))
        .and_then(rescan);

    health_route()
        .or(metrics_route())
        .or(status_route)
        .or(rescan_route)
}
