//! Command line front end.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::builder;
use crate::link;
use crate::logging;
use crate::session::{Session, SessionEvent};
use crate::settings::{AppPaths, AppSettings};
use crate::supervisor::{self, ProcessSupervisor};
use crate::system_proxy::{MemoryProxyTool, SystemProxyController};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Raybar - runs xray-core and points the system proxy at it
#[derive(Parser, Debug)]
#[command(name = "raybar", version, about)]
pub struct Args {
    /// Data directory for settings, the engine config and logs
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a session and supervise it until interrupted
    Run {
        /// Keep the system proxy untouched; changes go to an in-memory table
        #[arg(long)]
        dry_run: bool,
    },
    /// Print or write the engine config for the current settings
    Build {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Parse a node link and print it as JSON
    Parse { link: String },
    /// Print the links contained in a subscription body
    DecodeSubscription { file: PathBuf },
    /// Manage saved nodes
    Nodes {
        #[command(subcommand)]
        action: NodesCommand,
    },
    /// Inspect or reset the system proxy
    Proxy {
        #[command(subcommand)]
        action: ProxyCommand,
    },
    /// Print the engine version
    Version,
}

#[derive(Subcommand, Debug)]
enum NodesCommand {
    List,
    Add { link: String },
    /// Add every link of a subscription body
    Import { file: PathBuf },
    /// Select the node by name or link
    Use { name: String },
}

#[derive(Subcommand, Debug)]
enum ProxyCommand {
    Show,
    Clear,
}

pub fn run() -> Result<()> {
    let args = Args::parse();

    // Must happen before any thread exists so every thread inherits the mask.
    let interrupted = match args.command {
        Command::Run { .. } => watch_signals()?,
        _ => Arc::new(AtomicBool::new(false)),
    };

    let paths = AppPaths::resolve(args.home.clone())?;
    let level = if args.debug { "debug" } else { args.log_level.as_str() };
    let _guard = logging::init_logging(level, Some(&paths.logs_dir()));

    match args.command {
        Command::Run { dry_run } => run_session(&paths, dry_run, &interrupted),
        Command::Build { out } => build(&paths, out.as_deref()),
        Command::Parse { link } => {
            let node = link::parse(&link)?;
            println!("{}", serde_json::to_string_pretty(&node)?);
            Ok(())
        }
        Command::DecodeSubscription { file } => {
            for link in link::decode_subscription(&read_body(&file)?) {
                println!("{link}");
            }
            Ok(())
        }
        Command::Nodes { action } => nodes(&paths, action),
        Command::Proxy { action } => proxy(action),
        Command::Version => {
            let settings = AppSettings::load_or_init(&paths)?;
            let Some(executable) = settings.engine_path else {
                bail!("enginePath is not set in {}", paths.settings_file().display());
            };
            println!("{}", supervisor::engine_version(&executable)?);
            Ok(())
        }
    }
}

fn run_session(paths: &AppPaths, dry_run: bool, interrupted: &AtomicBool) -> Result<()> {
    paths.ensure()?;
    let settings = AppSettings::load_or_init(paths)?;
    let request = settings.start_request(paths);

    let engine = ProcessSupervisor::new().with_orphan_sweep(settings.reap_orphans);
    let proxy = if dry_run {
        info!("dry run, system proxy left untouched");
        SystemProxyController::new(Arc::new(MemoryProxyTool::new(["dry-run"])))
    } else {
        SystemProxyController::default()
    };
    let session = Session::new(Arc::new(engine), proxy).with_stop_mode(settings.stop_mode);
    let events = session.subscribe();

    if let Err(err) = session.start(&request) {
        if err.needs_permission() {
            warn!("allow the engine under System Settings > Privacy & Security, then retry");
        }
        let stage = err.stage();
        return Err(anyhow::Error::new(err).context(format!("session start failed at the {stage} stage")));
    }

    let outcome = loop {
        if interrupted.load(Ordering::SeqCst) {
            info!("interrupted, stopping session");
            break Ok(());
        }
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(SessionEvent::EngineOutput(line)) => println!("{line}"),
            Ok(SessionEvent::ProxyDegraded { action, report }) => {
                warn!(action, result = %report.summary(), "system proxy only partly changed");
            }
            Ok(SessionEvent::EngineExited { exit, .. }) => {
                break Err(anyhow::anyhow!(exit.describe()));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };
    session.shutdown();
    outcome
}

fn build(paths: &AppPaths, out: Option<&Path>) -> Result<()> {
    let settings = AppSettings::load_or_init(paths)?;
    let json = builder::build_json(&settings.session_config(paths))?;
    match out {
        Some(out) => {
            std::fs::write(out, json).with_context(|| format!("writing {}", out.display()))?;
            info!(path = %out.display(), "engine config written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn nodes(paths: &AppPaths, action: NodesCommand) -> Result<()> {
    let mut settings = AppSettings::load_or_init(paths)?;
    match action {
        NodesCommand::List => {
            for (link, node) in settings.nodes() {
                let marker = if settings.active_link.as_deref() == Some(link) {
                    "*"
                } else {
                    " "
                };
                match node {
                    Ok(node) => println!(
                        "{marker} {} ({} {}:{})",
                        node.name,
                        node.protocol.as_str(),
                        node.address,
                        node.port
                    ),
                    Err(err) => println!("{marker} {link} [{err}]"),
                }
            }
            return Ok(());
        }
        NodesCommand::Add { link } => {
            let node = settings.add_link(&link)?;
            println!("added {}", node.name);
        }
        NodesCommand::Import { file } => {
            let (added, rejected) = settings.import_subscription(&read_body(&file)?);
            for (link, err) in &rejected {
                warn!(%link, error = %err, "skipped link");
            }
            println!("added {added} node(s), skipped {}", rejected.len());
        }
        NodesCommand::Use { name } => {
            let node = settings.use_node(&name)?;
            println!("using {}", node.name);
        }
    }
    settings.save(paths)?;
    Ok(())
}

fn proxy(action: ProxyCommand) -> Result<()> {
    let controller = SystemProxyController::default();
    match action {
        ProxyCommand::Show => {
            println!("{}", serde_json::to_string_pretty(&controller.snapshot())?);
        }
        ProxyCommand::Clear => {
            let report = controller.clear();
            if report.no_effect() {
                bail!("system proxy was not cleared: {}", report.summary());
            }
            println!("{}", report.summary());
        }
    }
    Ok(())
}

fn read_body(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

/// Blocks SIGINT and SIGTERM and turns them into a flag set by a waiter
/// thread, so the session loop can unwind instead of dying mid-way.
#[cfg(unix)]
fn watch_signals() -> Result<Arc<AtomicBool>> {
    // SAFETY: the set is initialized by sigemptyset before use and only
    // changes this thread's signal mask.
    let set = unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            bail!("could not block termination signals");
        }
        set
    };

    let flag = Arc::new(AtomicBool::new(false));
    let raised = flag.clone();
    std::thread::spawn(move || {
        let mut signal: libc::c_int = 0;
        // SAFETY: both pointers are valid for the duration of the call.
        if unsafe { libc::sigwait(&set, &mut signal) } == 0 {
            info!(signal, "termination signal received");
        }
        raised.store(true, Ordering::SeqCst);
    });
    Ok(flag)
}

#[cfg(not(unix))]
fn watch_signals() -> Result<Arc<AtomicBool>> {
    Ok(Arc::new(AtomicBool::new(false)))
}
