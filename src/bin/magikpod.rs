//! MagikPod - Pod Sandbox CLI
//!
//! Drives pod sandboxes through the process controller. Every invocation
//! restores the persisted sandboxes first, so sandboxes created by one
//! invocation can be stopped and removed by later ones.
//!
//! ## Usage
//!
//! ```sh
//! magikpod run <pod.yaml> [--name <name>]
//! magikpod status <sandbox>
//! magikpod stop <sandbox> [--timeout <secs>]
//! magikpod rm <sandbox> [--force]
//! magikpod list
//! ```
//!
//! `<sandbox>` is an id, a unique id prefix, or a name.

use magikpod::{
    ControllerRegistry, CreateSandboxRequest, DaemonConfig, ProcessControllerFactory,
    RemoveOutcome, SandboxConfig, SandboxManager,
};
use anyhow::Context;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Config file read when `--config` is not given (if it exists).
const DEFAULT_CONFIG_PATH: &str = "/etc/magikpod/config.yaml";

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Run {
        pod_config: PathBuf,
        name: Option<String>,
        sandboxer: Option<String>,
        runtime_handler: String,
    },
    Status {
        key: String,
    },
    Stop {
        key: String,
        timeout: Option<u32>,
    },
    Remove {
        key: String,
        force: bool,
    },
    List,
    Version,
    Help,
}

#[derive(Debug)]
struct Cli {
    config: Option<PathBuf>,
    command: Command,
}

fn take_value(args: &[String], i: usize, flag: &str) -> Result<String, String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args() -> Result<Cli, String> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    // Global option, accepted anywhere.
    let mut config = None;
    if let Some(pos) = args.iter().position(|a| a == "--config" || a == "-c") {
        config = Some(PathBuf::from(take_value(&args, pos, "--config")?));
        args.drain(pos..pos + 2);
    }

    let Some(command) = args.first() else {
        return Ok(Cli {
            config,
            command: Command::Help,
        });
    };

    let command = match command.as_str() {
        "run" => {
            let pod_config = args
                .get(1)
                .map(PathBuf::from)
                .ok_or("run requires <pod.yaml>")?;
            let mut name = None;
            let mut sandboxer = None;
            let mut runtime_handler = String::new();
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--name" | "-n" => {
                        name = Some(take_value(&args, i, "--name")?);
                        i += 2;
                    }
                    "--sandboxer" => {
                        sandboxer = Some(take_value(&args, i, "--sandboxer")?);
                        i += 2;
                    }
                    "--runtime-handler" => {
                        runtime_handler = take_value(&args, i, "--runtime-handler")?;
                        i += 2;
                    }
                    other => return Err(format!("unknown option: {other}")),
                }
            }
            Command::Run {
                pod_config,
                name,
                sandboxer,
                runtime_handler,
            }
        }
        "status" | "inspect" => Command::Status {
            key: args.get(1).cloned().ok_or("status requires <sandbox>")?,
        },
        "stop" => {
            let key = args.get(1).cloned().ok_or("stop requires <sandbox>")?;
            let mut timeout = None;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--timeout" | "-t" => {
                        let value = take_value(&args, i, "--timeout")?;
                        timeout = Some(
                            value
                                .parse()
                                .map_err(|_| format!("invalid timeout: {value}"))?,
                        );
                        i += 2;
                    }
                    other => return Err(format!("unknown option: {other}")),
                }
            }
            Command::Stop { key, timeout }
        }
        "rm" | "remove" => {
            let key = args.get(1).cloned().ok_or("rm requires <sandbox>")?;
            let force = args[2..].iter().any(|a| a == "--force" || a == "-f");
            Command::Remove { key, force }
        }
        "list" | "ls" => Command::List,
        "version" | "--version" | "-V" => Command::Version,
        "help" | "--help" | "-h" => Command::Help,
        other => return Err(format!("unknown command: {other}")),
    };

    Ok(Cli { config, command })
}

// =============================================================================
// Setup
// =============================================================================

fn load_config(path: Option<PathBuf>) -> anyhow::Result<DaemonConfig> {
    let path = match path {
        Some(path) => path,
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                return Ok(DaemonConfig::default());
            }
            default
        }
    };
    Ok(DaemonConfig::load(&path)?)
}

async fn open_manager(config: DaemonConfig) -> anyhow::Result<SandboxManager> {
    let mut registry = ControllerRegistry::new();
    registry.register(Arc::new(ProcessControllerFactory::from_config(&config)));

    let manager = SandboxManager::new(config, Arc::new(registry));
    manager
        .restore()
        .await
        .context("failed to restore sandboxes")?;
    Ok(manager)
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn cmd_run(
    manager: &SandboxManager,
    pod_config: PathBuf,
    name: Option<String>,
    sandboxer: Option<String>,
    runtime_handler: String,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(&pod_config)
        .with_context(|| format!("failed to read {}", pod_config.display()))?;
    let config = SandboxConfig::from_yaml(&bytes)?;

    let request = CreateSandboxRequest {
        name: name.unwrap_or_default(),
        sandboxer,
        runtime_handler,
        net_ns_path: String::new(),
        config,
    };
    let sandbox = manager.run_sandbox(request).await?;

    println!("{}", sandbox.id());
    Ok(())
}

async fn cmd_status(manager: &SandboxManager, key: String) -> anyhow::Result<()> {
    let sandbox = manager.get(&key)?;
    if let Err(e) = sandbox.update_status().await {
        tracing::warn!(sandbox = %sandbox.id(), error = %e, "Status reconciliation failed");
    }
    let status = sandbox.status().await?;
    let json = serde_json::to_string_pretty(&status).context("serialize status")?;
    println!("{json}");
    Ok(())
}

async fn cmd_stop(manager: &SandboxManager, key: String, timeout: Option<u32>) -> anyhow::Result<()> {
    manager.stop(&key, timeout).await?;
    eprintln!("Stopped sandbox {key}");
    Ok(())
}

async fn cmd_remove(manager: &SandboxManager, key: String, force: bool) -> anyhow::Result<()> {
    match manager.remove(&key, force).await? {
        RemoveOutcome::Removed => eprintln!("Removed sandbox {key}"),
        RemoveOutcome::AlreadyRemoving => eprintln!("Sandbox {key} is already being removed"),
    }
    Ok(())
}

async fn cmd_list(manager: &SandboxManager) -> anyhow::Result<()> {
    println!("ID\tNAME\tSTATUS\tPID\tCONTAINERS");
    for sandbox in manager.list()? {
        let status = sandbox.status().await?;
        let short_id: String = status.id.chars().take(12).collect();
        println!(
            "{}\t{}\t{}\t{}\t{}",
            short_id,
            status.name,
            status.status,
            status.pid,
            status.containers.len()
        );
    }
    Ok(())
}

fn cmd_version() {
    println!("magikpod version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"magikpod - Pod sandbox lifecycle manager

USAGE:
    magikpod [--config <path>] <command> [options]

COMMANDS:
    run <pod.yaml>            Create and start a sandbox, print its id
    status <sandbox>          Show sandbox status (JSON)
    stop <sandbox>            Stop a sandbox
    rm <sandbox>              Remove a stopped sandbox
    list                      List sandboxes
    version                   Show version info
    help                      Show this help

OPTIONS:
    --config, -c <path>       Daemon config (default: /etc/magikpod/config.yaml)
    --name, -n <name>         Sandbox name (run)
    --sandboxer <name>        Sandboxer (run, default from config)
    --runtime-handler <name>  Runtime handler (run)
    --timeout, -t <secs>      Stop timeout (stop, default from config)
    --force, -f               Stop a running sandbox before removing (rm)

ENVIRONMENT:
    RUST_LOG                  Log filter (default: info)

EXAMPLES:
    magikpod run pod.yaml --name web
    magikpod stop web --timeout 5
    magikpod rm web
"#
    );
}

// =============================================================================
// Main
// =============================================================================

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config)?;

    match cli.command {
        Command::Version => {
            cmd_version();
            Ok(())
        }
        Command::Help => {
            cmd_help();
            Ok(())
        }
        command => {
            let manager = open_manager(config).await?;
            match command {
                Command::Run {
                    pod_config,
                    name,
                    sandboxer,
                    runtime_handler,
                } => cmd_run(&manager, pod_config, name, sandboxer, runtime_handler).await,
                Command::Status { key } => cmd_status(&manager, key).await,
                Command::Stop { key, timeout } => cmd_stop(&manager, key, timeout).await,
                Command::Remove { key, force } => cmd_remove(&manager, key, force).await,
                Command::List => cmd_list(&manager).await,
                Command::Version | Command::Help => Ok(()),
            }
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e}");
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
