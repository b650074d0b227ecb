//! Graceful interrupt handling.
//!
//! An [`Interrupt`] is a per-session cancellation token. Pressing Ctrl-C (once a
//! listener is installed) raises it instead of killing the process; the
//! training loop checks it only after a completed batch and after an epoch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineResult;

/// Idempotent stop request shared between the loop and the signal listener.
#[derive(Debug, Clone)]
pub struct Interrupt {
    token: CancellationToken,
    notice: Arc<Once>,
    listening: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            notice: Arc::new(Once::new()),
            listening: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Raise the flag. Returns `true` only for the call that actually raised it.
    pub fn trigger(&self) -> bool {
        let mut raised = false;
        self.notice.call_once(|| {
            debug!("SIGINT caught, waiting for graceful exit");
            self.token.cancel();
            raised = true;
        });
        raised
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The underlying token, for code that wants to await the stop request.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Route Ctrl-C to [`trigger`](Self::trigger) for the rest of the process lifetime.
    ///
    /// The listener runs on its own thread with a single-threaded runtime.
    /// Installing twice is a no-op.
    pub fn install_ctrl_c_handler(&self) -> EngineResult<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let interrupt = self.clone();
        let spawned = std::thread::Builder::new()
            .name("trainloop-sigint".into())
            .spawn(move || {
                runtime.block_on(async move {
                    while tokio::signal::ctrl_c().await.is_ok() {
                        interrupt.trigger();
                    }
                });
            });
        if let Err(e) = spawned {
            self.listening.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        debug!("Installed Ctrl-C listener");
        Ok(())
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}
