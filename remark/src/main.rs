//! remark - comment tracker daemon and status CLI
//!
//! Subcommands:
//! - `run`: capture daemon (watcher + delivery engine + relay hub)
//! - `status`: one-shot presentation process; asks the daemon over the
//!   relay for the resolved identity and today's count
//! - `flush`: manually drain the outbox once
//! - `pending`: list outbox records awaiting delivery
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/remark/outbox.db
//! - Logs: $XDG_STATE_HOME/remark/remark.log
//! - Config: $XDG_CONFIG_HOME/remark/config.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use remark_core::capture::{CommentExtractor, EventWatcher};
use remark_core::delivery::{self, CollectorClient, DeliveryEngine};
use remark_core::identity::IdentityResolver;
use remark_core::relay::{Message, RelayHub, RelayPeer};
use remark_core::{Config, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "remark")]
#[command(about = "Track and deliver your authored comments")]
#[command(version)]
struct Args {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the capture daemon
    Run,

    /// Show today's comment count and progress toward the daily goal
    Status,

    /// Drain the outbox to the collector once
    Flush,

    /// List outbox records awaiting delivery
    Pending,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    match args.command {
        Command::Run => cmd_run(config).await,
        Command::Status => cmd_status(config).await,
        Command::Flush => cmd_flush(config, args.verbose).await,
        Command::Pending => cmd_pending(),
    }
}

async fn cmd_run(config: Config) -> Result<()> {
    let _log_guard =
        remark_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("remark daemon starting");

    if config.watcher.roots.is_empty() {
        anyhow::bail!(
            "no watch roots configured; add [watcher] roots = [...] to {}",
            Config::config_path().display()
        );
    }
    config
        .delivery
        .validate()
        .context("invalid delivery configuration")?;

    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening outbox");
    let store = Arc::new(Store::open(&db_path).context("failed to open outbox")?);
    store.migrate().context("failed to run outbox migrations")?;

    let resolver = Arc::new(IdentityResolver::with_default_probes(
        Arc::clone(&store),
        &config.identity,
        &config.watcher.roots,
    ));

    let watcher = EventWatcher::new(
        Arc::clone(&store),
        Arc::clone(&resolver),
        Arc::new(CommentExtractor),
        config.watcher.roots.clone(),
    );
    watcher.rescan().context("initial view-log scan failed")?;

    // Shutdown plumbing: ctrl-c flips the flag, every task watches it
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })
    .context("failed to install shutdown handler")?;

    // Relay hub, served on the unix socket for sibling processes
    let hub = RelayHub::new();
    let socket_path = config.relay.socket_path();
    let hub_task = {
        let hub = hub.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.serve(&socket_path, rx).await {
                tracing::error!(error = %e, "Relay hub failed");
            }
        })
    };

    // Delivery engine, woken by captured events, a timer, and shutdown
    let collector = Arc::new(
        CollectorClient::new(&config.delivery).context("failed to create collector client")?,
    );
    let engine = Arc::new(DeliveryEngine::new(
        Arc::clone(&store),
        Arc::clone(&collector),
        hub.clone(),
        &config.delivery,
        config.relay.timezone.clone(),
    ));
    let engine_task = {
        let engine = Arc::clone(&engine);
        let captured = watcher.captured_signal();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(captured, rx).await })
    };

    // Count/identity responder for presentation processes
    let responder_task = tokio::spawn(delivery::run_responder(
        Arc::clone(&collector),
        Arc::clone(&resolver),
        hub.clone(),
        shutdown_rx.clone(),
    ));

    // Identity may not be resolvable yet; keep re-polling until it is
    let identity = resolver.resolve().context("identity resolution failed")?;
    let repoll_task = if identity.is_empty() {
        tracing::info!("Actor identity unresolved, re-polling in the background");
        Some(resolver.spawn_repoll(Duration::from_secs(config.identity.poll_interval_secs)))
    } else {
        tracing::info!(actor = %identity.key, "Actor identity resolved");
        None
    };

    // Filesystem notifications drive the capture loop, batched by the
    // debouncer; a periodic rescan catches anything the notifier misses.
    let (fs_tx, mut fs_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let mut debouncer = new_debouncer(
        Duration::from_millis(750),
        move |res: DebounceEventResult| match res {
            Ok(_) => {
                let _ = fs_tx.send(());
            }
            Err(e) => tracing::warn!(error = ?e, "View-log watch error"),
        },
    )
    .context("failed to create filesystem watcher")?;
    for root in &config.watcher.roots {
        debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;
    }

    let mut rescan_tick =
        tokio::time::interval(Duration::from_secs(config.watcher.rescan_interval_secs));
    rescan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = shutdown_rx.clone();

    println!("remark daemon running (ctrl-c to stop)");
    println!("  outbox: {}", db_path.display());
    println!("  relay:  {}", config.relay.socket_path().display());

    loop {
        tokio::select! {
            _ = fs_rx.recv() => {}
            _ = rescan_tick.tick() => {}
            res = shutdown.changed() => {
                let _ = res;
                break;
            }
        }

        if let Err(e) = watcher.rescan() {
            tracing::warn!(error = %e, "View-log rescan failed");
        }
        match watcher.poll_all() {
            Ok(stats) if stats.admitted > 0 => {
                tracing::info!(
                    admitted = stats.admitted,
                    duplicates = stats.duplicates,
                    rejected = stats.rejected,
                    "Capture pass complete"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Capture pass failed"),
        }
    }

    tracing::info!("Shutting down");
    drop(debouncer);

    // The engine runs one best-effort flush on shutdown; wait for it, but
    // not forever. The durable outbox is the safety net, not this hook.
    let _ = tokio::time::timeout(Duration::from_secs(10), engine_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), hub_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), responder_task).await;
    if let Some(task) = repoll_task {
        task.abort();
    }

    Ok(())
}

async fn cmd_status(config: Config) -> Result<()> {
    let socket_path = config.relay.socket_path();
    let mut peer = match RelayPeer::connect(&socket_path).await {
        Ok(peer) => peer,
        Err(_) => {
            println!("Daemon not reachable at {}", socket_path.display());
            println!("Start it with: remark run");
            return Ok(());
        }
    };

    peer.send(&Message::RequestIdentity).await?;
    let identity = loop {
        match tokio::time::timeout(Duration::from_secs(5), peer.recv()).await {
            Ok(Ok(Some(Message::IdentityReply { identity }))) => break identity,
            Ok(Ok(Some(_))) => continue,
            Ok(Ok(None)) => anyhow::bail!("relay closed before replying"),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => anyhow::bail!("timed out waiting for identity reply"),
        }
    };

    if identity.is_empty() {
        println!("Actor identity not resolved yet; counts unavailable.");
        return Ok(());
    }

    let date = chrono::Local::now().date_naive().to_string();
    peer.send(&Message::RequestCount {
        actor_key: identity.key.clone(),
        date: date.clone(),
        timezone: config.relay.timezone.clone(),
    })
    .await?;

    let count = loop {
        match tokio::time::timeout(Duration::from_secs(5), peer.recv()).await {
            Ok(Ok(Some(Message::CountUpdated { count }))) => break count,
            Ok(Ok(Some(_))) => continue,
            Ok(Ok(None)) => anyhow::bail!("relay closed before replying"),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => anyhow::bail!("timed out waiting for count"),
        }
    };

    let goal = config.status.goal.max(1) as i64;
    let percent = ((count * 100) / goal).min(100);

    println!("Comment Tracker ({})", date);
    println!();
    if !identity.name.is_empty() {
        println!("Actor:          {} ({})", identity.name, identity.key);
    } else {
        println!("Actor:          {}", identity.key);
    }
    println!("Comments today: {} / {}", count, goal);
    println!("Progress:       {}%", percent);

    Ok(())
}

async fn cmd_flush(config: Config, verbose: bool) -> Result<()> {
    config
        .delivery
        .validate()
        .context("invalid delivery configuration")?;

    let db_path = Config::database_path();
    if !db_path.exists() {
        println!("Outbox not found at {}", db_path.display());
        return Ok(());
    }

    let store = Arc::new(Store::open(&db_path).context("failed to open outbox")?);
    store.migrate().context("failed to run outbox migrations")?;

    let pending = store.pending_count()?;
    if pending == 0 {
        println!("Outbox is empty.");
        return Ok(());
    }

    println!("Flushing {} pending record(s)...", pending);

    let collector = Arc::new(
        CollectorClient::new(&config.delivery).context("failed to create collector client")?,
    );
    let engine = DeliveryEngine::new(
        Arc::clone(&store),
        collector,
        RelayHub::new(),
        &config.delivery,
        config.relay.timezone.clone(),
    );

    let report = engine.drain().await?;

    println!();
    println!("Delivered: {}", report.delivered);
    println!("Pending:   {}", report.pending);
    if let Some(delay) = report.next_retry {
        println!(
            "Head record failed; the daemon will retry after {:?}.",
            delay
        );
        if verbose {
            if let Some(head) = store.head_unsynced()? {
                println!(
                    "Head: #{} ({} prior attempt(s))",
                    head.local_id, head.retry_count
                );
            }
        }
    }

    Ok(())
}

fn cmd_pending() -> Result<()> {
    let db_path = Config::database_path();
    if !db_path.exists() {
        println!("Outbox not found at {}", db_path.display());
        return Ok(());
    }

    let store = Store::open(&db_path).context("failed to open outbox")?;
    store.migrate().context("failed to run outbox migrations")?;

    let pending = store.list_unsynced()?;
    if pending.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }

    println!("Pending Outbox Records");
    println!("======================");
    println!();
    println!("{:<8} {:>8} {:<22} TEXT", "ID", "RETRIES", "OCCURRED AT");
    println!("{:-<70}", "");

    for record in pending {
        let text: String = if record.event.text.chars().count() > 36 {
            let truncated: String = record.event.text.chars().take(33).collect();
            format!("{}...", truncated)
        } else {
            record.event.text.clone()
        };

        println!(
            "{:<8} {:>8} {:<22} {}",
            record.local_id,
            record.retry_count,
            record.event.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            text
        );
    }

    Ok(())
}
