//! Reproduces the "stop helper" tool: sends `SIGINT` to a running service,
//! waits up to a timeout, then escalates to `SIGTERM` if it is still alive.
use std::fs;
use std::process::ExitCode;
use std::thread::sleep;
use std::time::{Duration, Instant};

use clap::Parser;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

/// Signal a service to stop, escalating to SIGTERM if it ignores SIGINT.
#[derive(Parser, Debug)]
#[command(name = "stop-helper", version)]
struct Args {
    /// Target process, either a numeric pid or a `/proc/<pid>/comm` name.
    #[arg(long)]
    service: String,

    /// Seconds to wait after SIGINT before escalating to SIGTERM.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("warn").init();
    let args = Args::parse();

    let pid = match resolve_pid(&args.service) {
        Some(pid) => pid,
        None => {
            warn!("no process matching `{}` found", args.service);
            return ExitCode::SUCCESS;
        }
    };

    if !is_alive(pid) {
        return ExitCode::SUCCESS;
    }

    if let Err(e) = kill(pid, Signal::SIGINT) {
        warn!("SIGINT to {pid}: {e}");
    } else {
        info!("sent SIGINT to {pid}");
    }

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return ExitCode::SUCCESS;
        }
        sleep(Duration::from_millis(100));
    }

    if !is_alive(pid) {
        return ExitCode::SUCCESS;
    }

    if let Err(e) = kill(pid, Signal::SIGTERM) {
        warn!("SIGTERM to {pid}: {e}");
    } else {
        info!("sent SIGTERM to {pid}");
    }
    sleep(Duration::from_millis(200));

    if is_alive(pid) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn is_alive(pid: Pid) -> bool {
    // `kill(pid, None)` sends no signal, just checks existence/permission.
    kill(pid, None).is_ok()
}

fn resolve_pid(service: &str) -> Option<Pid> {
    if let Ok(raw) = service.parse::<i32>() {
        return Some(Pid::from_raw(raw));
    }
    find_pid_by_comm(service)
}

fn find_pid_by_comm(name: &str) -> Option<Pid> {
    let entries = fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let pid_str = entry.file_name();
        let Some(pid_str) = pid_str.to_str() else { continue };
        let Ok(raw) = pid_str.parse::<i32>() else { continue };
        let comm_path = entry.path().join("comm");
        if let Ok(comm) = fs::read_to_string(&comm_path) {
            if comm.trim() == name {
                return Some(Pid::from_raw(raw));
            }
        }
    }
    None
}
