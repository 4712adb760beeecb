use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::warn;

use lavastorm_engine::DriverStopper;

#[derive(Debug)]
pub struct ShutdownController {
    forced: AtomicU8,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            forced: AtomicU8::new(0),
        }
    }

    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// First interrupt asks the driver to stop gracefully (kill active jobs,
/// then exit 0); a second interrupt exits immediately.
pub fn spawn_ctrl_c_handler(shutdown: Arc<ShutdownController>, stopper: DriverStopper) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let n = shutdown.bump_forced();
            if n == 1 {
                warn!("interrupt received, killing active jobs before exiting (press CTRL+C again to exit immediately)");
                stopper.request_stop();
            } else {
                warn!("interrupt received again, exiting immediately");
                std::process::exit(130);
            }
        }
    });
}
