//! The zone manager daemon: defines, launches, supervises and interconnects
//! zones on one host, talking to clients and in-zone helpers over its
//! runtime socket.

use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{setgroups, setresgid, setresuid, Uid, User};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, Level};
use zone_ipc::{Client, EventPoll, MethodResult, Service, ThreadDispatcher, UniqueId};
use zone_runtime::process::Channel;

use zoned::config::DaemonConfig;
use zoned::manager::ZonesManager;

#[derive(Parser)]
#[command(name = "zoned", about = "Linux zone manager daemon", disable_version_flag = true)]
struct Args {
    /// show application version
    #[arg(short = 'v', long)]
    version: bool,

    /// check runtime environment and exit
    #[arg(short = 'c', long)]
    check: bool,

    /// don't drop root privileges at startup
    #[arg(short = 'r', long)]
    root: bool,

    /// TRACE, DEBUG, INFO, WARN or ERROR
    #[arg(short = 'l', long, default_value = "INFO")]
    log_level: String,

    /// daemon configuration file
    #[arg(long, default_value = "/etc/zoned/daemon.json")]
    config: PathBuf,
}

fn parse_level(text: &str) -> Option<Level> {
    match text.to_ascii_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" => Some(Level::WARN),
        "ERROR" => Some(Level::ERROR),
        _ => None,
    }
}

/// Everything except the stop signals stays blocked; zone children reset
/// their masks before exec.
fn block_signals() -> anyhow::Result<()> {
    let mut mask = SigSet::all();
    mask.remove(Signal::SIGTERM);
    mask.remove(Signal::SIGINT);
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)?;
    Ok(())
}

fn drop_root(user_name: &str) -> anyhow::Result<()> {
    if !Uid::effective().is_root() {
        return Ok(());
    }
    let user = User::from_name(user_name)?
        .with_context(|| format!("no such user: {}", user_name))?;
    setgroups(&[user.gid])?;
    setresgid(user.gid, user.gid, user.gid)?;
    setresuid(user.uid, user.uid, user.uid)?;
    info!("dropped privileges to {}", user_name);
    Ok(())
}

/// Exercises the reactor, the helper channel and an RPC echo end to end.
fn self_test() -> bool {
    let outcome = (|| -> anyhow::Result<()> {
        let ids = (UniqueId::new(), UniqueId::new());
        anyhow::ensure!(ids.0 != ids.1, "message ids collide");

        let (left, right) = Channel::pair()?;
        left.send(&0xC0FFEEu32)?;
        anyhow::ensure!(right.recv::<u32>()? == 0xC0FFEE, "channel round trip");

        let poll = Arc::new(EventPoll::new()?);
        {
            let (rx, tx) = nix::unistd::pipe()?;
            let fired = Arc::new(AtomicBool::new(false));
            let seen = Arc::clone(&fired);
            poll.add_fd(
                rx.as_raw_fd(),
                zone_ipc::epoll::Events::EPOLLIN,
                Box::new(move |_, _| {
                    seen.store(true, Ordering::SeqCst);
                    false
                }),
            )?;
            nix::unistd::write(tx.as_fd(), b"x")?;
            anyhow::ensure!(poll.dispatch_iteration(100)?, "poll dispatch");
            anyhow::ensure!(fired.load(Ordering::SeqCst), "poll handler");
        }

        let _dispatcher = ThreadDispatcher::new(Arc::clone(&poll))?;

        let dir = std::env::temp_dir().join(format!("zoned-check-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let socket = dir.join("check.socket");

        let mut service = Service::new(Arc::clone(&poll), &socket)?;
        service.set_method(1, |_, text: String, result: MethodResult<String>| {
            result.set(&text.to_uppercase());
            Ok(())
        });
        service.start()?;

        let mut client = Client::new(Arc::clone(&poll))?;
        client.connect_unix(&socket)?;
        let reply: String = client.call_sync(
            1,
            &"ping".to_string(),
            std::time::Duration::from_millis(2000),
        )?;
        anyhow::ensure!(reply == "PING", "rpc echo");

        client.stop(true);
        service.stop(true);
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            println!("Environment check passed.");
            true
        }
        Err(e) => {
            eprintln!("Environment check failed: {:#}", e);
            false
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    block_signals()?;

    let config = if args.config.exists() {
        DaemonConfig::load(&args.config)?
    } else {
        DaemonConfig::default()
    };
    let run_as = config.run_as.clone();

    let poll = Arc::new(EventPoll::new()?);
    let mut dispatcher = ThreadDispatcher::new(Arc::clone(&poll))?;
    let manager = ZonesManager::new(poll, config)?;

    if !args.root {
        drop_root(&run_as)?;
    }

    manager.restore_all()?;
    info!("daemon ready");

    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    if let Some(signal) = signals.forever().next() {
        info!("got signal {}, shutting down", signal);
    }

    manager.shutdown();
    dispatcher.stop();
    info!("daemon stopped");
    Ok(())
}

fn main() {
    let args = Args::parse();

    if args.version {
        println!("zoned {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let Some(level) = parse_level(&args.log_level) else {
        eprintln!("unknown log level: {}", args.log_level);
        std::process::exit(1);
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if args.check {
        println!("Checking runtime environment...");
        std::process::exit(if self_test() { 0 } else { 1 });
    }

    match run(&args) {
        Ok(()) => {}
        Err(e) => {
            error!("fatal: {:#}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_level("chatty"), None);
    }

    #[test]
    fn self_test_passes_here() {
        assert!(self_test());
    }
}
