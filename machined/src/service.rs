//! The single-threaded event loop tying the sockets, signals and clock to
//! the daemon core.

use crate::config::{MachinedConfig, Options};
use crate::daemon::{Daemon, Host};
use crate::transport::{resolve_internal, Transport};
use crate::wire::MAX_PACKET_SIZE;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Upper bound on a loop iteration when no timer is pending.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Run until SIGTERM or SIGINT, then persist the process table.
pub async fn run(opts: Options) -> Result<()> {
    let config = MachinedConfig::load_or_default(&opts.config);
    let addr = resolve_internal(config.internal_interface()).await?;
    let transport = Transport::bind(addr, opts.port).context("opening daemon sockets")?;

    let mut daemon = Daemon::new(addr, opts.port, config, Host::system(), StdRng::from_entropy())
        .with_config_path(&opts.config);
    match daemon.restore_state(&opts.state_file) {
        Ok(r) if r.restored + r.dropped > 0 => {
            info!(restored = r.restored, dropped = r.dropped, "process table restored")
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, path = %opts.state_file.display(), "could not restore process table"),
    }

    let epoch = Instant::now();
    let now_ms = || epoch.elapsed().as_millis() as u64;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigchld = signal(SignalKind::child())?;

    daemon.start(now_ms());
    flush(&transport, &mut daemon);

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let wait = daemon
            .next_timeout(now_ms())
            .map(Duration::from_millis)
            .unwrap_or(IDLE_WAIT);
        tokio::select! {
            r = transport.recv_any(&mut buf) => match r {
                Ok((n, from, via)) => daemon.handle_datagram(now_ms(), &buf[..n], from, via),
                Err(e) => warn!(error = %e, "receive failed"),
            },
            _ = tokio::time::sleep(wait) => {}
            _ = sigchld.recv() => {
                daemon.reap_children();
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
        daemon.fire_timers(now_ms());
        flush(&transport, &mut daemon);
    }

    info!("shutting down");
    match daemon.save_state(&opts.state_file) {
        Ok(n) => info!(entries = n, "process table saved"),
        Err(e) => error!(error = %e, path = %opts.state_file.display(), "could not save process table"),
    }
    Ok(())
}

fn flush(transport: &Transport, daemon: &mut Daemon) {
    for d in daemon.drain_outbox() {
        if let Err(e) = transport.send(&d) {
            warn!(dest = %d.dest, error = %e, "send failed");
        }
    }
}
