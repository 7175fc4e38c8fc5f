//! Worker-pool supervision (spec §4.7/§5), reimplementing the original's
//! fork-after-bind `dirpy_main`/`spawn_worker`/watchdog loop. Rust has no
//! portable, safe `fork()` once a `tokio` runtime is initialized, so each
//! worker is instead a re-exec'd child process that binds its own
//! `SO_REUSEPORT` socket on the same address/port; the kernel load-balances
//! accepted connections across them.

use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;

/// Env var marker a re-exec'd child looks for to know it should run as a
/// single worker instead of the supervisor.
pub const WORKER_ENV_VAR: &str = "DIRPY_WORKER_ROLE";

struct Worker {
    child: Child,
}

/// Spawn one worker, retrying up to 3 times with a 1s backoff, matching
/// `spawn_worker`. Returns `None` (a fatal condition, per the original) if
/// every attempt fails.
fn spawn_worker(exe: &std::path::Path, config_path: Option<&std::path::Path>) -> Option<Worker> {
    let mut attempts = 3;
    while attempts > 0 {
        let mut cmd = Command::new(exe);
        cmd.env(WORKER_ENV_VAR, "1");
        if let Some(path) = config_path {
            cmd.arg("-c").arg(path);
        }
        match cmd.spawn() {
            Ok(child) => return Some(Worker { child }),
            Err(e) => {
                attempts -= 1;
                tracing::info!("Failed to spawn worker ({e}); {attempts} more attempt(s)");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
    None
}

/// Run the supervisor: spawn `cfg.num_workers` children, then watchdog
/// them forever, restarting any that die. Blocks until `SIGINT`.
pub fn run_supervisor(cfg: &Config, config_path: Option<&std::path::Path>) -> std::io::Result<()> {
    let exe = std::env::current_exe()?;

    let mut workers = Vec::with_capacity(cfg.num_workers);
    for _ in 0..cfg.num_workers {
        match spawn_worker(&exe, config_path) {
            Some(w) => workers.push(w),
            None => {
                tracing::error!("Unable to spawn worker after 3 attempts");
                std::process::exit(1);
            }
        }
    }

    tracing::info!("Dirpy daemon started! Herp da dirp!");
    tracing::info!(
        "Listening on {}:{}, using {} worker(s)",
        cfg.bind_addr,
        cfg.bind_port,
        cfg.num_workers
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone()) {
        tracing::warn!("Failed to install SIGINT handler: {e}");
    }

    loop {
        std::thread::sleep(Duration::from_secs(1));

        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("Received SIGINT; terminating worker pool");
            for worker in &mut workers {
                let _ = worker.child.kill();
            }
            std::process::exit(0);
        }

        for i in 0..workers.len() {
            let died = match workers[i].child.try_wait() {
                Ok(Some(_status)) => true,
                Ok(None) => false,
                Err(_) => true,
            };
            if died {
                tracing::error!("Worker {} died; restarting it.", i + 1);
                let _ = workers[i].child.wait();
                match spawn_worker(&exe, config_path) {
                    Some(w) => workers[i] = w,
                    None => {
                        tracing::error!("Unable to spawn worker after 3 attempts");
                        std::process::exit(1);
                    }
                }
            }
        }
    }
}

/// Bind a `SO_REUSEPORT` socket on `addr:port`, matching the original's
/// `HttpTimeoutServer.server_bind` (`SO_REUSEADDR` + `TCP_NODELAY`), plus
/// `SO_REUSEPORT` so every worker process can bind the same port.
pub fn bind_reuseport(addr: &str, port: u16, timeout: Option<Duration>) -> std::io::Result<std::net::TcpListener> {
    let address: std::net::SocketAddr = format!("{addr}:{port}").parse().map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid bind address: {e}"))
    })?;

    let domain = if address.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    if let Some(timeout) = timeout {
        socket.set_read_timeout(Some(timeout))?;
    }
    socket.bind(&address.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

pub fn is_worker_process() -> bool {
    std::env::var(WORKER_ENV_VAR).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_env_var_round_trips() {
        std::env::set_var(WORKER_ENV_VAR, "1");
        assert!(is_worker_process());
        std::env::remove_var(WORKER_ENV_VAR);
        assert!(!is_worker_process());
    }
}
