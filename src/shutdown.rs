//! Waits for the process to be asked to stop.

use anyhow::{Context, Result};
use tokio::runtime::{Builder, Runtime};

/// Signal handlers installed up front, so a signal that arrives while the
/// servers start up is not lost.
pub struct ShutdownSignal {
    runtime: Runtime,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    pub fn install() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("unable to start signal runtime")?;
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let _guard = runtime.enter();
            let interrupt =
                signal(SignalKind::interrupt()).context("unable to handle SIGINT")?;
            let terminate =
                signal(SignalKind::terminate()).context("unable to handle SIGTERM")?;
            Ok(Self {
                runtime,
                interrupt,
                terminate,
            })
        }
        #[cfg(not(unix))]
        Ok(Self { runtime })
    }

    /// Blocks until SIGINT or SIGTERM. Returns the signal name.
    #[cfg(unix)]
    pub fn wait(self) -> Result<&'static str> {
        let Self {
            runtime,
            mut interrupt,
            mut terminate,
        } = self;
        let name = runtime.block_on(async {
            tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            }
        });
        Ok(name)
    }

    #[cfg(not(unix))]
    pub fn wait(self) -> Result<&'static str> {
        self.runtime
            .block_on(tokio::signal::ctrl_c())
            .context("unable to wait for Ctrl+C")?;
        Ok("Ctrl+C")
    }
}
