use std::{future::IntoFuture, process, sync::Arc};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use trefa::{
    application::{error::AppError, inventory::InventoryService},
    cache::{CacheConfig, CacheStore},
    config,
    infra::{
        error::InfraError,
        http::{self, AdminGuard, RouterState},
        postgrest::{PostgrestConfig, PostgrestInventory},
        telemetry,
    },
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging).map_err(AppError::from)?;
            run_serve(settings).await
        }
        config::Command::CheckConfig(_) => {
            println!("{settings:#?}");
            Ok(())
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let store = Arc::new(CacheStore::new(cache_config.max_entries_non_zero()));

    let backend = PostgrestInventory::new(&PostgrestConfig {
        url: settings.backend.url.clone(),
        api_key: settings.backend.api_key.clone(),
        timeout: settings.backend.timeout,
    })?;

    let inventory = Arc::new(InventoryService::new(
        Arc::new(backend),
        Arc::clone(&store),
        cache_config.clone(),
    ));

    let sweeper = spawn_expiry_sweeper(Arc::clone(&inventory), &cache_config);

    let guard = AdminGuard::from_settings(&settings.admin);
    if matches!(guard, AdminGuard::Locked) {
        warn!("no revalidation key configured; POST /api/cache/revalidate will refuse every caller");
    }

    let result = serve_http(&settings, RouterState::new(inventory, guard)).await;

    if let Some(handle) = sweeper {
        handle.abort();
        let _ = handle.await;
    }

    result
}

/// Periodically drops expired entries so idle keys do not hold capacity.
fn spawn_expiry_sweeper(
    inventory: Arc<InventoryService>,
    config: &CacheConfig,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        return None;
    }
    let period = config.sweep_period()?;
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let removed = inventory.purge_expired();
            if removed > 0 {
                info!(target = "trefa::cache::sweeper", removed, "swept expired entries");
            }
        }
    }))
}

async fn serve_http(settings: &config::Settings, state: RouterState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "listening");

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(());
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            return result.map_err(|err| AppError::unexpected(format!("server error: {err}")));
        }
        Ok(()) = signalled_rx => {
            info!("shutdown signal received; draining connections");
        }
    }

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(result) => result.map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(_) => {
            warn!(
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "graceful shutdown timed out"
            );
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
