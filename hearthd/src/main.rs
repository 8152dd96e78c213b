mod http;
mod ipc;
mod queue;
mod registry;
mod router;
mod runner;
mod scheduler;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hearth_core::{load_config, AgentEvent, Store};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::http::AppState;
use crate::ipc::{IpcSettings, IpcWatcher};
use crate::queue::{GroupQueue, PendingPrompt, ProcessPromptFn, QueueConfig};
use crate::registry::GroupRegistry;
use crate::router::OutputRouter;
use crate::runner::{OutputCallback, RunRequest, RunnerContext, SpawnCallback};
use crate::scheduler::SchedulerSettings;

#[derive(Parser, Debug)]
#[command(name = "hearthd", version, about = "Host orchestrator for multi-group agent containers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the hearthd HTTP service.
    Serve(ServeArgs),
    /// Print the effective config as JSON.
    PrintConfig(PrintConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/hearth.toml")]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/hearth.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/hearth.toml"),
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = Arc::new(
        load_config(&args.config)
            .with_context(|| format!("failed to load config from {}", args.config.display()))?,
    );

    if config.container.skip_runtime_check {
        warn!("container runtime check skipped by config");
    } else {
        if let Err(err) = runner::ensure_runtime_available(&config.container.runtime_bin).await {
            eprintln!("hearthd cannot start: {err}");
            std::process::exit(1);
        }
        runner::cleanup_orphans(&config.container.runtime_bin, &config.container.name_prefix)
            .await;
    }

    let data_dir = PathBuf::from(&config.storage.data_dir);
    let groups_dir = PathBuf::from(&config.storage.groups_dir);
    for dir in [
        data_dir.join("ipc"),
        data_dir.join("snapshots"),
        groups_dir.clone(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let store = Store::open(Path::new(&config.storage.store_dir).join("messages.db"))?;
    let registry = Arc::new(GroupRegistry::load(store.clone(), groups_dir.clone()).await?);
    registry.ensure_main(&config.main_group_folder).await?;

    let output_router = Arc::new(OutputRouter::new());
    let group_queue = Arc::new(GroupQueue::new(QueueConfig {
        idle_timeout: Duration::from_millis(config.container.idle_timeout_ms),
        exit_grace: Duration::from_millis(config.container.exit_grace_ms),
        runtime_bin: config.container.runtime_bin.clone(),
    }));

    {
        let probe_router = output_router.clone();
        group_queue
            .set_subscriber_probe(Arc::new(move |group_id| probe_router.has_subscriber(group_id)))
            .await;
    }

    let runner_ctx = RunnerContext {
        runtime_bin: config.container.runtime_bin.clone(),
        image: config.container.image.clone(),
        name_prefix: config.container.name_prefix.clone(),
        data_dir: data_dir.clone(),
        groups_dir: groups_dir.clone(),
        assistant_name: config.assistant_name.clone(),
    };
    group_queue
        .set_process_prompt_fn(build_process_prompt_fn(
            store.clone(),
            registry.clone(),
            group_queue.clone(),
            output_router.clone(),
            runner_ctx,
            config.main_group_folder.clone(),
        ))
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = IpcWatcher::new(
        IpcSettings {
            base_dir: data_dir.join("ipc"),
            poll_interval: Duration::from_millis(config.ipc.poll_interval_ms),
            assistant_name: config.assistant_name.clone(),
            main_group_folder: config.main_group_folder.clone(),
            timezone: config.scheduler.timezone.clone(),
        },
        store.clone(),
        registry.clone(),
        output_router.clone(),
    );
    tokio::spawn(watcher.run(shutdown_rx.clone()));

    tokio::spawn(scheduler::run_scheduler_loop(
        SchedulerSettings {
            poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
            timezone: config.scheduler.timezone.clone(),
        },
        store.clone(),
        registry.clone(),
        group_queue.clone(),
        shutdown_rx.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        registry,
        queue: group_queue.clone(),
        router: output_router,
        active_sse: Arc::new(std::sync::Mutex::new(Default::default())),
    };
    let server = tokio::spawn(http::serve(state, shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    shutdown_tx.send(true).ok();
    group_queue
        .shutdown(Duration::from_millis(config.server.shutdown_grace_ms))
        .await;

    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => error!(err = %err, "http server error during shutdown"),
        Ok(Err(err)) => error!(err = %err, "http server task panicked"),
        Err(_) => warn!("http server did not stop in time"),
    }

    info!("hearthd stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(err = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Build the callback the queue invokes to run a pending prompt: resolve the
/// group and session, run the container, and route its events.
fn build_process_prompt_fn(
    store: Store,
    registry: Arc<GroupRegistry>,
    queue: Arc<GroupQueue>,
    router: Arc<OutputRouter>,
    runner_ctx: RunnerContext,
    main_group_folder: String,
) -> ProcessPromptFn {
    Arc::new(move |group_id: String, pending: PendingPrompt| {
        let store = store.clone();
        let registry = registry.clone();
        let queue = queue.clone();
        let router = router.clone();
        let runner_ctx = runner_ctx.clone();
        let main_group_folder = main_group_folder.clone();

        Box::pin(async move {
            let Some(group) = registry.get(&group_id).await else {
                warn!(group_id = group_id.as_str(), "prompt for unknown group dropped");
                return false;
            };
            let is_main = group.folder == main_group_folder;

            let session_id = if pending.isolated {
                None
            } else {
                match store.get_session(&group.folder).await {
                    Ok(session) => session,
                    Err(err) => {
                        warn!(group_id = group_id.as_str(), err = %err, "failed to load session");
                        None
                    }
                }
            };

            let spawn_queue = queue.clone();
            let spawn_group = group_id.clone();
            let on_spawn: SpawnCallback = Box::new(move |handle| {
                Box::pin(async move {
                    spawn_queue.register_process(&spawn_group, handle).await;
                })
            });

            let output_router = router.clone();
            let output_group = group_id.clone();
            let on_output: OutputCallback = Arc::new(move |event| {
                let router = output_router.clone();
                let group_id = output_group.clone();
                Box::pin(async move {
                    router.emit(&group_id, event).await;
                })
            });

            let request = RunRequest {
                group,
                prompt: pending.prompt,
                session_id,
                is_main,
                scheduled: pending.scheduled,
            };
            match runner::run_agent(&runner_ctx, &store, &registry, request, on_spawn, on_output)
                .await
            {
                Ok(outcome) => outcome.success,
                Err(err) => {
                    error!(group_id = group_id.as_str(), err = %err, "container run failed to start");
                    router
                        .emit(
                            &group_id,
                            AgentEvent::Error {
                                error: format!("failed to start agent container: {err}"),
                            },
                        )
                        .await;
                    false
                }
            }
        })
    })
}
