//! Supervisor entrypoint: configuration, startup checks, task spawning,
//! signal-driven shutdown.

use nanoclaw::config::Config;
use nanoclaw::db::Db;
use nanoclaw::debounce::{DEBOUNCE_WINDOW, Debouncer};
use nanoclaw::dispatch::Dispatch;
use nanoclaw::mailbox::{Mailbox, ServiceCommand};
use nanoclaw::messaging::console::ConsoleClient;
use nanoclaw::mounts::MountAllowlist;
use nanoclaw::pool::{PoolSettings, WorkerPool};
use nanoclaw::registry::ChatRegistry;
use nanoclaw::router::SessionRouter;
use nanoclaw::scheduler::Scheduler;
use nanoclaw::sessions::SessionStore;
use nanoclaw::store::Store;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // With NANOCLAW_LOG_DIR set (e.g. under a process supervisor), logs go to
    // a daily-rolling file instead of the terminal.
    match std::env::var_os("NANOCLAW_LOG_DIR") {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, "nanoclaw.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Leak the guard so the non-blocking writer lives for the entire
            // process; it is cleaned up on exit.
            std::mem::forget(guard);
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact();
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
        None => {
            let fmt_layer = tracing_subscriber::fmt::layer().compact();
            tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        }
    }
}

/// Probe the container runtime binary. Missing runtime is fatal: nothing can
/// be dispatched without it.
async fn check_container_runtime(runtime_bin: &str) -> bool {
    tokio::process::Command::new(runtime_bin)
        .arg("--version")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("nanoclaw: invalid configuration: {error:#}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level);
    tracing::info!(
        assistant = %config.assistant_name,
        image = %config.image,
        data_dir = %config.data_dir.display(),
        "nanoclaw supervisor starting"
    );

    if !check_container_runtime(&config.runtime_bin).await {
        eprintln!("==================================================");
        eprintln!(" container runtime '{}' is not available", config.runtime_bin);
        eprintln!(" install it or set CONTAINER_RUNTIME, then restart");
        eprintln!("==================================================");
        std::process::exit(1);
    }

    let db = match Db::connect(&config.db_path()).await {
        Ok(db) => db,
        Err(error) => {
            eprintln!("nanoclaw: failed to open store: {error}");
            std::process::exit(1);
        }
    };
    let store = Store::new(db.pool.clone());

    let registry = match ChatRegistry::load(config.registered_chats_file()) {
        Ok(registry) => Arc::new(registry),
        Err(error) => {
            eprintln!("nanoclaw: failed to load registered chats: {error:#}");
            std::process::exit(1);
        }
    };
    let sessions = match SessionStore::load(config.sessions_file()) {
        Ok(sessions) => Arc::new(sessions),
        Err(error) => {
            eprintln!("nanoclaw: failed to load session map: {error:#}");
            std::process::exit(1);
        }
    };

    let allowlist = MountAllowlist::load(&config.allowlist_path);
    let router = SessionRouter::new(store.clone(), config.main_chat_id);
    let pool = WorkerPool::new(PoolSettings {
        runtime_bin: config.runtime_bin.clone(),
        image: config.image.clone(),
        default_timeout: config.request_timeout,
        max_output_bytes: config.max_output_bytes,
        idle_timeout: config.warm_idle_timeout,
    });
    let reaper = pool.spawn_reaper();

    // Platform client. The console adapter stands in for a real platform
    // connection; the bot token would be handed to a real client here.
    let platform = Arc::new(ConsoleClient);

    let dispatch = Dispatch::new(
        Arc::clone(&config),
        store.clone(),
        Arc::clone(&registry),
        router,
        Arc::clone(&pool),
        Arc::clone(&sessions),
        platform.clone(),
        allowlist,
    );

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let (flush_tx, mut flush_rx) = mpsc::channel(64);
    let (service_tx, mut service_rx) = mpsc::channel(4);

    let debouncer = Debouncer::new(DEBOUNCE_WINDOW, flush_tx);

    let reader = ConsoleClient::spawn_reader(event_tx);

    let event_dispatch = Arc::clone(&dispatch);
    let event_debouncer = debouncer.clone();
    let event_loop = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            event_dispatch.handle_event(event, &event_debouncer).await;
        }
    });

    let flush_dispatch = Arc::clone(&dispatch);
    let flush_loop = tokio::spawn(async move {
        while let Some(batch) = flush_rx.recv().await {
            flush_dispatch.handle_flush(batch).await;
        }
    });

    let mailbox = Mailbox::new(
        Arc::clone(&config),
        store.clone(),
        Arc::clone(&registry),
        platform,
        service_tx,
    );
    let mailbox_loop = mailbox.spawn();

    let scheduler = Arc::new(Scheduler::new(
        store,
        Arc::clone(&sessions),
        Arc::clone(&dispatch),
        config.timezone,
        config.scheduler_poll,
    ));
    let scheduler_loop = scheduler.spawn();

    tracing::info!("nanoclaw supervisor ready");

    // Wait for a termination signal or a service-control request.
    let mut rebuild_requested = false;
    loop {
        let command = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                None
            }
            _ = sigterm() => {
                tracing::info!("SIGTERM received, shutting down");
                None
            }
            command = service_rx.recv() => command,
        };

        match command {
            None => break,
            Some(ServiceCommand::Restart) => {
                tracing::warn!("restart requested, exiting after grace period");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                break;
            }
            Some(ServiceCommand::Rebuild) => {
                rebuild_requested = true;
                break;
            }
        }
    }

    // Shutdown: stop ingress, flush pending debounce buffers through the
    // dispatcher, then take down the warm pool.
    reader.abort();
    event_loop.abort();
    debouncer.flush_all().await;
    drop(debouncer);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), flush_loop).await;

    mailbox_loop.abort();
    scheduler_loop.abort();
    reaper.abort();
    pool.shutdown().await;
    db.close().await;

    if rebuild_requested {
        tracing::warn!(command = %config.rebuild_command, "running rebuild");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&config.rebuild_command)
            .current_dir(&config.project_root)
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {
                tracing::info!("rebuild succeeded, exiting for restart");
            }
            Ok(status) => {
                tracing::error!(%status, "rebuild failed");
                std::process::exit(1);
            }
            Err(error) => {
                tracing::error!(%error, "rebuild command could not be run");
                std::process::exit(1);
            }
        }
    }

    tracing::info!("nanoclaw supervisor stopped");
}

#[cfg(unix)]
async fn sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(error) => {
            tracing::warn!(%error, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
