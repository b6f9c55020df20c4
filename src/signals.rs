//! Ctrl+C handling for runs
//!
//! The first Ctrl+C cancels the run so the agent is stopped and the
//! workspace cleaned up. A second one within two seconds exits at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;

/// Exit status after an interrupt
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Window in which a second Ctrl+C forces an exit
const DOUBLE_PRESS_WINDOW: Duration = Duration::from_secs(2);

/// What an interrupt should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Cancel the run and let it unwind
    Cancel,
    /// Stop waiting and exit
    Exit,
}

/// Turns interrupts into cancellation
#[derive(Debug, Clone)]
pub struct SignalHandler {
    cancel: CancellationToken,
    interrupt_count: Arc<AtomicUsize>,
}

impl SignalHandler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            interrupt_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Install the process-wide Ctrl+C handler
    pub fn install(&self) -> Result<()> {
        let handler = self.clone();

        ctrlc::set_handler(move || {
            if handler.interrupt() == Interrupt::Exit {
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
        })
        .map_err(|e| crate::Error::Config(format!("Failed to set signal handler: {}", e)))?;

        Ok(())
    }

    /// Record one interrupt
    pub fn interrupt(&self) -> Interrupt {
        let count = self.interrupt_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            info!("Interrupt received, stopping the run (press Ctrl+C again to exit now)");
            self.cancel.cancel();

            // Reset after a delay so a double press has to be quick
            let count_clone = self.interrupt_count.clone();
            std::thread::spawn(move || {
                std::thread::sleep(DOUBLE_PRESS_WINDOW);
                count_clone.store(0, Ordering::SeqCst);
            });
            Interrupt::Cancel
        } else {
            debug!("Second interrupt received");
            Interrupt::Exit
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
