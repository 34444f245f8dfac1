use log::{error, info, warn};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use warp::Filter;

use lumapix::ai_client::AiClient;
use lumapix::config::{self, Config};
use lumapix::db;
use lumapix::geocoder::Geocoder;
use lumapix::housekeeping::Housekeeper;
use lumapix::object_store::ObjectStore;
use lumapix::places::PlaceResolver;
use lumapix::processor::Processor;
use lumapix::quarantine::Quarantine;
use lumapix::queue::{QueueServer, TaskQueue};
use lumapix::scanner::Scanner;
use lumapix::video_processor;
use lumapix::{handlers_places, handlers_processor, handlers_scanner};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const QUEUE_NAME: &str = "process_file";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::init_logging();

    let config = Config::from_env()?;

    info!("Starting lumapix ingestion services");
    info!("Uploads: {}", config.uploads_dir);
    info!("Media: {}", config.media_dir);
    info!("Failed: {}", config.failed_dir);

    for port in [
        config.scanner.port,
        config.processor.port,
        config.places.port,
    ] {
        if !is_port_available(port) {
            error!("Port {} is already in use", port);
            return Err(format!("port {} is already in use", port).into());
        }
    }

    // Video ingestion is impossible without the ffmpeg tools; refuse to
    // start rather than quarantine every video later.
    video_processor::ensure_tools_available()?;

    std::fs::create_dir_all(&config.uploads_dir)?;
    std::fs::create_dir_all(&config.media_dir)?;
    std::fs::create_dir_all(&config.failed_dir)?;

    let db_pool = db::create_db_pool(&config.database_url).await?;
    let mut settings = match db::crud::load_settings(&db_pool).await {
        Ok(settings) => {
            info!("Loaded {} setting(s) from the catalog", settings.len());
            settings
        }
        Err(e) => {
            warn!("Could not load settings: {}", e);
            Default::default()
        }
    };

    // Settings are read-mostly; refresh on a timer instead of per request.
    {
        let db_pool = db_pool.clone();
        let refresh = config.settings_refresh;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(refresh);
            tick.tick().await;
            loop {
                tick.tick().await;
                match db::crud::load_settings(&db_pool).await {
                    Ok(fresh) => {
                        if fresh != settings {
                            info!("Settings changed ({} entries)", fresh.len());
                            settings = fresh;
                        }
                    }
                    Err(e) => warn!("Settings refresh failed: {}", e),
                }
            }
        });
    }

    let task_queue =
        TaskQueue::connect(&config.redis_url, QUEUE_NAME, config.queue.dedup_window).await?;
    let queue_server =
        QueueServer::connect(&config.redis_url, QUEUE_NAME, config.queue.max_retries).await?;
    queue_server.recover_stale_active().await?;

    let uploads_root = PathBuf::from(&config.uploads_dir);
    let store = ObjectStore::new(&config.media_dir);
    let quarantine = Quarantine::new(&config.failed_dir);

    let ai = match &config.ai_service_url {
        Some(url) => Some(AiClient::new(url)?),
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut service_handles = Vec::new();

    // Processor: worker pool draining the queue.
    let processor = Arc::new(Processor::new(
        db_pool.clone(),
        store.clone(),
        quarantine.clone(),
        uploads_root.clone(),
        config.preview.clone(),
    ));
    service_handles.extend(queue_server.start(
        processor.clone(),
        config.processor.workers,
        shutdown_rx.clone(),
    ));
    info!("Processor started with {} workers", config.processor.workers);

    // Scanner: change notifications plus the polling sweep.
    let scanner = Arc::new(Scanner::new(
        uploads_root.clone(),
        config.scanner.clone(),
        task_queue.clone(),
        quarantine.clone(),
        db_pool.clone(),
        ai,
    ));
    service_handles.extend(scanner.clone().start(shutdown_rx.clone()));
    info!("Scanner watching {}", config.uploads_dir);

    // Place resolver: timed sweeps against the geocoder.
    let geocoder = Geocoder::new(&config.places.nominatim_url, config.places.rate_limit)?;
    let resolver = Arc::new(PlaceResolver::new(
        db_pool.clone(),
        geocoder,
        config.places.clone(),
    ));
    service_handles.push(resolver.clone().start(shutdown_rx.clone()));
    info!("Place resolver sweeping every {:?}", config.places.sweep_interval);

    // Housekeeping: hourly trash purge, plus one pass right away so a
    // restart never postpones overdue cleanup by an hour.
    let housekeeper = Housekeeper::new(db_pool.clone(), store.clone());
    let _housekeeping_thread = housekeeper.start();
    {
        let housekeeper = housekeeper.clone();
        tokio::spawn(async move {
            if let Err(e) = housekeeper.purge_expired_trash().await {
                error!("Startup trash purge failed: {}", e);
            }
        });
    }

    // Per-service HTTP surfaces.
    {
        let routes = handlers_scanner::routes(scanner.clone())
            .with(warp::log("lumapix::scanner"))
            .recover(lumapix::warp_helpers::handle_rejection);
        let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(
            ([0, 0, 0, 0], config.scanner.port),
            shutdown_signal(shutdown_rx.clone()),
        );
        tokio::spawn(server);
    }
    {
        let routes = handlers_processor::routes(
            processor.clone(),
            task_queue.clone(),
            quarantine.clone(),
            uploads_root.clone(),
            db_pool.clone(),
        )
        .with(warp::log("lumapix::processor"))
        .recover(lumapix::warp_helpers::handle_rejection);
        let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(
            ([0, 0, 0, 0], config.processor.port),
            shutdown_signal(shutdown_rx.clone()),
        );
        tokio::spawn(server);
    }
    {
        let routes = handlers_places::routes(resolver.clone())
            .with(warp::log("lumapix::places"))
            .recover(lumapix::warp_helpers::handle_rejection);
        let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(
            ([0, 0, 0, 0], config.places.port),
            shutdown_signal(shutdown_rx.clone()),
        );
        tokio::spawn(server);
    }
    info!(
        "HTTP surfaces on ports {} (scanner), {} (processor), {} (places)",
        config.scanner.port, config.processor.port, config.places.port
    );

    wait_for_shutdown_signal().await;
    info!("Shutdown requested, draining in-flight work");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for handle in service_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(
            "Shutdown grace of {:?} expired with work still in flight; the queue will redeliver",
            SHUTDOWN_GRACE
        );
    }

    db_pool.close().await;
    info!("Clean shutdown");
    Ok(())
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

fn shutdown_signal(
    mut shutdown: watch::Receiver<bool>,
) -> impl std::future::Future<Output = ()> + Send + 'static {
    async move {
        let _ = shutdown.changed().await;
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
