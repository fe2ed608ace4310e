use std::{net::SocketAddr, process, sync::Arc, time::Duration};

use tokio::signal;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use voxgate::{
    cache::CacheService,
    config::{self, Settings},
    error::AppError,
    infra::{
        error::InfraError,
        http::{self, AppState},
        telemetry,
    },
    rate_limit::RateLimiter,
};

const SERVE_TARGET: &str = "voxgate::serve";

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
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
        config::Command::Resolve(args) => run_resolve(&settings, &args.path),
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let cache = Arc::new(CacheService::from_config(&settings.cache));
    let rate_limiter = RateLimiter::new(settings.rate_limit.clone()).map_err(InfraError::from)?;
    let state = AppState::new(Arc::clone(&cache), settings.cache.clone(), rate_limiter);
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;
    info!(
        target: SERVE_TARGET,
        addr = %settings.server.addr,
        cache_backend = cache.mode().as_str(),
        response_cache = settings.cache.enabled,
        rate_limit = settings.rate_limit.enabled,
        "listening"
    );

    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    close_cache(&cache, settings.server.graceful_shutdown).await;
    info!(target: SERVE_TARGET, "shutdown complete");
    result
}

async fn close_cache(cache: &CacheService, timeout: Duration) {
    if tokio::time::timeout(timeout, cache.close()).await.is_err() {
        warn!(
            target: SERVE_TARGET,
            timeout_secs = timeout.as_secs(),
            "cache backend did not close in time"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(target: SERVE_TARGET, error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(target: SERVE_TARGET, error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: SERVE_TARGET, "received ctrl-c, shutting down"),
        _ = terminate => info!(target: SERVE_TARGET, "received SIGTERM, shutting down"),
    }
}

fn run_resolve(settings: &Settings, path: &str) -> Result<(), AppError> {
    let rate_limiter = RateLimiter::new(settings.rate_limit.clone()).map_err(InfraError::from)?;
    let route = rate_limiter.resolve(path);
    let exempt = settings.rate_limit.is_exempt_path(path);

    println!("path: {path}");
    if exempt {
        println!("rate limit: exempt");
    } else {
        println!(
            "rate limit: {} requests per {} ms (namespace `{}`)",
            route.policy.max, route.policy.window_ms, route.namespace
        );
    }

    let cacheable = settings
        .cache
        .is_cacheable(&axum::http::Method::GET, path);
    if cacheable {
        println!(
            "response cache: GET cached for {} s",
            settings.cache.ttl_for(path).as_secs()
        );
        let vary = settings.cache.vary_for(path);
        if !vary.is_empty() {
            println!("vary: {}", vary.join(", "));
        }
    } else {
        println!("response cache: not cached");
    }

    Ok(())
}

