use roomies_server::engine::{Engine, SystemClock};
use roomies_server::{server, storage};
mod cli;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    use clap::Parser;
    let args = cli::Cli::parse();

    // Console-only logging with env-driven level
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .init();

    let config = match server::AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error=%e, "Failed to load config");
            std::process::exit(2);
        }
    };
    let settings = match config.engine_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error=%e, "Invalid engine settings");
            std::process::exit(2);
        }
    };

    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "data/app.db".into());
    // Ensure data dir exists when using default
    if let Some(parent) = std::path::Path::new(&db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        let _ = std::fs::create_dir_all(parent);
    }
    let store = match storage::Store::connect_sqlite(&db_path).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error=%e, path=%db_path, "Failed to connect DB");
            std::process::exit(3);
        }
    };

    // Seed users/households/tasks from config
    if let Err(e) = store
        .seed_from_config(&config.households, &config.users, &config.tasks)
        .await
    {
        tracing::error!(error=%e, "Failed to seed DB");
        std::process::exit(4);
    }

    let engine = Engine::new(store, settings, Arc::new(SystemClock));

    if let Some(cmd) = args.command {
        std::process::exit(run_report(&engine, cmd).await);
    }

    // Decide listen port: env PORT overrides config.listen_port, default 5252
    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .or(config.listen_port)
        .unwrap_or(5252);

    let state = server::AppState::new(config, engine);
    let shutdown_token = state.shutdown_token();
    let shutdown_token_for_server = shutdown_token.clone();

    let app = server::router(state);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    tracing::info!(%addr, "Starting server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error=%e, %addr, "Failed to bind listener");
            std::process::exit(5);
        }
    };

    // Graceful shutdown on SIGINT/SIGTERM with fallback timeout to force-close SSE streams
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_token_for_server.cancelled_owned())
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown: initiating graceful stop");
    // Ends open event streams and signals the server to stop accepting
    shutdown_token.cancel();
    match tokio::time::timeout(std::time::Duration::from_secs(3), &mut server_task).await {
        Ok(join_res) => match join_res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(%err, "server error"),
            Err(e) => tracing::error!(error=%e, "server task join error"),
        },
        Err(_) => {
            tracing::warn!("shutdown: forcing server abort due to timeout");
            server_task.abort();
        }
    }
}

/// Print a JSON report to stdout. Returns the process exit code.
async fn run_report(engine: &Engine, cmd: cli::Command) -> i32 {
    let json = match cmd {
        cli::Command::Leaderboard { household, period } => engine
            .leaderboard
            .rank(&household, period)
            .await
            .map(|entries| roomies_shared::api::LeaderboardDto {
                household_id: household.clone(),
                period,
                entries,
            })
            .map(|dto| serde_json::to_string_pretty(&dto))
            .map_err(|e| e.to_string()),
        cli::Command::Analytics { household } => engine
            .analytics
            .snapshot(&household)
            .await
            .map(|dto| serde_json::to_string_pretty(&dto))
            .map_err(|e| e.to_string()),
    };
    match json {
        Ok(Ok(text)) => {
            println!("{text}");
            0
        }
        Ok(Err(e)) => {
            tracing::error!(error=%e, "Failed to encode report");
            1
        }
        Err(e) => {
            tracing::error!(error=%e, "Report failed");
            1
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error=%e, "shutdown: signal handlers unavailable; using Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("shutdown: received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("shutdown: received SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown: received Ctrl+C");
    }
}
