//! Coalescing wake signal between the listener and the observer.

use std::sync::Arc;

use enactor_events::WakeUp;
use tokio::sync::Notify;

/// Set-semantics wake flag: any number of wakes before the observer looks
/// collapse into one.
#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    notify: Arc<Notify>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Never blocks.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait until the flag is raised, consuming it.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl WakeUp for WakeSignal {
    fn wake_up(&self) {
        self.wake();
    }
}
