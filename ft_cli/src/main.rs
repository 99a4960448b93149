use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::Context;
use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use ft_server::{AppState, FallbackMode, FallbackProxy, sweep_orphans};
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "filetracker-server", version, about = "Content-addressed file storage server", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0")]
    listen: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value_t = 9999)]
    port: u16,

    /// Data directory, holds blobs/, staging/ and db/
    #[arg(short = 'd', long = "dir", default_value = "./filetracker-data")]
    dir: PathBuf,

    /// Append logs to this file instead of stderr
    #[arg(short = 'L', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'D', long = "daemonize")]
    daemonize: bool,

    /// Legacy origin consulted on GET/HEAD misses during migration
    #[arg(long = "fallback-url")]
    fallback_url: Option<Url>,

    /// How fallback hits are served
    #[arg(long = "fallback-mode", value_enum, default_value_t = FallbackModeArg::Redirect)]
    fallback_mode: FallbackModeArg,

    /// Remove unreferenced blob files before serving
    #[arg(long = "sweep")]
    sweep: bool,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum FallbackModeArg {
    Redirect,
    Proxy,
}

impl From<FallbackModeArg> for FallbackMode {
    fn from(arg: FallbackModeArg) -> Self {
        match arg {
            FallbackModeArg::Redirect => FallbackMode::Redirect,
            FallbackModeArg::Proxy => FallbackMode::Proxy,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();

    // Forking does not change the working directory, but resolving the
    // paths up front keeps log lines and errors unambiguous.
    cli.dir = std::path::absolute(&cli.dir).context("resolve data directory")?;
    if let Some(log_file) = &cli.log_file {
        cli.log_file = Some(std::path::absolute(log_file).context("resolve log file path")?);
    }

    // The daemon fork must happen before the runtime exists: forking a
    // process with live worker threads forfeits all of them.
    if cli.daemonize {
        daemonize().context("daemonize")?;
    }

    init_logging(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(run(cli))
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {path:?}"))?;
            tracing_subscriber::fmt()
                .with_max_level(cli.verbosity.clone())
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(cli.verbosity.clone())
                .init();
        }
    }
    Ok(())
}

#[cfg(unix)]
fn daemonize() -> anyhow::Result<()> {
    use std::os::fd::AsRawFd;

    use nix::unistd::{ForkResult, dup2, fork, setsid};

    // First fork: the parent returns control to the shell.
    match unsafe { fork() }.context("first fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid")?;
    // Second fork: the session leader exits so the daemon can never
    // reacquire a controlling terminal.
    match unsafe { fork() }.context("second fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")?;
    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd).context("redirect stdio")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn daemonize() -> anyhow::Result<()> {
    anyhow::bail!("daemonizing is only supported on unix");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let fallback = cli
        .fallback_url
        .map(|base| FallbackProxy::new(base, cli.fallback_mode.into()));
    if fallback.is_some() {
        info!("fallback enabled in {:?} mode", cli.fallback_mode);
    }

    let state = AppState::open(&cli.dir, fallback)
        .with_context(|| format!("open data directory {:?}", cli.dir))?;

    if cli.sweep {
        sweep_orphans(&state.db, &state.store, &state.locks)
            .await
            .context("startup blob sweep")?;
    }

    ft_server::serve(SocketAddr::new(cli.listen, cli.port), state).await
}
