//! mroutemgrd - static multicast routing daemon
//!
//! Enables kernel multicast routing for IPv4 and IPv6, installs the
//! configured routes and serves kernel upcalls until SIGTERM/SIGINT.
//! SIGHUP re-reads the configuration and rebuilds all state.

use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use mroute_common::{AddressFamily, V4, V6};
use mroutemgrd::kernel::read_upcall;
use mroutemgrd::{
    ControlChannel, InterfaceDirectory, MrouteConfig, MrouteDaemon, RecordingChannel,
    SocketChannel, DEFAULT_CONFIG_PATH,
};
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Static multicast routing daemon
#[derive(Parser, Debug)]
#[command(name = "mroutemgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'f', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Record kernel operations instead of programming the kernel
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting mroutemgrd ---");
    if args.dry_run {
        info!("Dry-run mode: ENABLED");
    }

    let result = if args.dry_run {
        run(&args.config, RecordingChannel::new(), RecordingChannel::new()).await
    } else {
        run(&args.config, SocketChannel::new(), SocketChannel::new()).await
    };

    match result {
        Ok(()) => {
            info!("mroutemgrd exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("mroutemgrd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}

fn load(path: &Path) -> Result<(InterfaceDirectory, MrouteConfig)> {
    let config = MrouteConfig::load_or_default(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate().context("validating configuration")?;

    let ifaces = InterfaceDirectory::discover().context("discovering interfaces")?;
    debug!("Discovered {} interfaces", ifaces.len());

    Ok((ifaces, config))
}

enum Event {
    Upcalls,
    Reload,
    Stop,
}

/// Upcall descriptors registered with the reactor.
#[derive(Default)]
struct UpcallSources {
    v4: Option<AsyncFd<RawFd>>,
    v6: Option<AsyncFd<RawFd>>,
}

impl UpcallSources {
    fn watch<C4: ControlChannel<V4>, C6: ControlChannel<V6>>(
        daemon: &MrouteDaemon<C4, C6>,
    ) -> Self {
        Self {
            v4: watch_fd(daemon.upcall_fd(AddressFamily::Ipv4)),
            v6: watch_fd(daemon.upcall_fd(AddressFamily::Ipv6)),
        }
    }
}

fn watch_fd(fd: Option<RawFd>) -> Option<AsyncFd<RawFd>> {
    let fd = fd?;
    match AsyncFd::with_interest(fd, Interest::READABLE) {
        Ok(afd) => Some(afd),
        Err(e) => {
            error!("Cannot watch control socket {}: {}", fd, e);
            None
        }
    }
}

async fn readable(afd: &Option<AsyncFd<RawFd>>) -> io::Result<AsyncFdReadyGuard<'_, RawFd>> {
    match afd {
        Some(afd) => afd.readable().await,
        None => std::future::pending().await,
    }
}

/// Reads every pending message off a ready control socket.
fn drain(
    ready: io::Result<AsyncFdReadyGuard<'_, RawFd>>,
    buf: &mut [u8],
    mut handle: impl FnMut(&[u8]),
) {
    let mut guard = match ready {
        Ok(guard) => guard,
        Err(e) => {
            warn!("Control socket poll failed: {}", e);
            return;
        }
    };

    loop {
        match guard.try_io(|afd| read_upcall(*afd.get_ref(), buf)) {
            Ok(Ok(len)) => handle(&buf[..len]),
            Ok(Err(e)) => {
                warn!("Control socket read failed: {}", e);
                guard.clear_ready();
                break;
            }
            Err(_would_block) => break,
        }
    }
}

async fn run<C4, C6>(config_path: &Path, v4: C4, v6: C6) -> Result<()>
where
    C4: ControlChannel<V4>,
    C6: ControlChannel<V6>,
{
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    let (ifaces, config) = load(config_path)?;
    let mut buf = vec![0u8; config.daemon.upcall_buffer_size];

    let mut daemon = MrouteDaemon::new(config, ifaces, v4, v6);
    daemon.start();
    let mut sources = UpcallSources::watch(&daemon);

    info!("mroutemgrd initialization complete");

    loop {
        let event = tokio::select! {
            _ = sighup.recv() => Event::Reload,
            _ = sigterm.recv() => Event::Stop,
            _ = sigint.recv() => Event::Stop,
            ready = readable(&sources.v4) => {
                drain(ready, &mut buf, |msg| daemon.handle_upcall(AddressFamily::Ipv4, msg));
                Event::Upcalls
            }
            ready = readable(&sources.v6) => {
                drain(ready, &mut buf, |msg| daemon.handle_upcall(AddressFamily::Ipv6, msg));
                Event::Upcalls
            }
        };

        match event {
            Event::Upcalls => {}
            Event::Reload => {
                info!("Received SIGHUP");
                match load(config_path) {
                    Ok((ifaces, config)) => {
                        // Deregister before the sockets are closed
                        drop(std::mem::take(&mut sources));
                        buf.resize(config.daemon.upcall_buffer_size, 0);
                        daemon.reload(ifaces, config);
                        sources = UpcallSources::watch(&daemon);
                    }
                    Err(e) => error!("Reload failed, keeping current state: {:#}", e),
                }
            }
            Event::Stop => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    drop(sources);
    daemon.stop();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_reads_all_pending() {
        let (rx, tx) = UnixDatagram::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        tx.send(b"one").unwrap();
        tx.send(b"two").unwrap();
        let afd = AsyncFd::with_interest(rx.as_raw_fd(), Interest::READABLE).unwrap();
        let mut buf = [0u8; 64];
        let mut seen = Vec::new();

        drain(afd.readable().await, &mut buf, |msg| seen.push(msg.to_vec()));

        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_drain_clears_readiness_on_read_error() {
        // recv on a pipe fails with ENOTSOCK while data stays pending
        let mut fds: [RawFd; 2] = [-1; 2];
        // SAFETY: fds has room for the two descriptors pipe2 writes
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        // SAFETY: pipe2 succeeded, so both descriptors are open and owned here
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        std::fs::File::from(write_end).write_all(b"x").unwrap();
        let afd = AsyncFd::with_interest(read_end.as_raw_fd(), Interest::READABLE).unwrap();
        let mut buf = [0u8; 64];
        let mut calls = 0;

        drain(afd.readable().await, &mut buf, |_| calls += 1);

        assert_eq!(calls, 0);
        let again = tokio::time::timeout(Duration::from_millis(50), afd.readable()).await;
        assert!(again.is_err());
    }
}
