//! # arbord — container tree daemon
//!
//! Privileged daemon managing a hierarchy of Linux containers over cgroups
//! v1. Serves RPC on a unix socket; one thread runs the timed event queue,
//! one the epoll loop for OOM notifiers, one the SIGCHLD reaper.

#![allow(clippy::print_stderr)]

mod rpc;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use arbor_common::config::DaemonConfig;
use arbor_runtime::{events, recovery, task, Runtime};

#[derive(Parser)]
#[command(name = "arbord", about = "Container tree daemon", version)]
struct Cli {
    /// Path to the daemon configuration file.
    #[arg(long, default_value = "/etc/arbor/arbord.json")]
    config: PathBuf,

    /// Log filter, overriding RUST_LOG.
    #[arg(long)]
    log: Option<String>,
}

fn main() -> anyhow::Result<()> {
    // The sentinel re-exec must not touch clap or tracing: it inherits a
    // clean stdin protocol and nothing else.
    if std::env::args().nth(1).as_deref() == Some(task::SENTINEL_ARG) {
        task::run_sentinel();
    }

    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(spec) => tracing_subscriber::EnvFilter::new(spec),
        None => tracing_subscriber::EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let rt = Runtime::new(config).context("building runtime context")?;

    recovery::restore_all(&rt).context("restoring containers")?;

    let stop = Arc::new(AtomicBool::new(false));

    let event_rt = Arc::clone(&rt);
    let event_thread = std::thread::Builder::new()
        .name(String::from("events"))
        .spawn(move || event_rt.events.run(&event_rt))
        .context("spawning event thread")?;

    let epoll_rt = Arc::clone(&rt);
    let epoll_stop = Arc::clone(&stop);
    std::thread::Builder::new()
        .name(String::from("epoll"))
        .spawn(move || epoll_rt.epoll.run(&epoll_rt, &epoll_stop))
        .context("spawning epoll thread")?;

    let reaper_rt = Arc::clone(&rt);
    let reaper_stop = Arc::clone(&stop);
    std::thread::Builder::new()
        .name(String::from("reaper"))
        .spawn(move || events::run_reaper(&reaper_rt, &reaper_stop))
        .context("spawning reaper thread")?;

    // Kick off the self-rescheduling rotation sweep.
    rt.events.add(rt.config.log_rotate_ms, events::Event::RotateLogs);

    tracing::info!(socket = %rt.config.socket_path.display(), "arbord ready");
    let serve_result = rpc::serve(&rt);

    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    rt.events.stop();
    let _ = event_thread.join();

    serve_result
}
