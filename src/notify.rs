// Run-state and progress notification contracts.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Lifecycle states of a download run.
///
/// ```text
/// STARTED ──(pause)───► PAUSED ──(resume)──► RESUMED ──► (processing resumes)
/// STARTED ──(cancel)──► CANCELLED ──► STOPPED
/// STARTED ──(all done)► COMPLETED ──► STOPPED
/// STARTED ──(error)───► ERROR     ──► STOPPED
/// ```
///
/// `Stopped` is always the final notification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Started,
    Paused,
    Resumed,
    Cancelled,
    Completed,
    Error,
    Stopped,
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "STARTED",
            Self::Paused => "PAUSED",
            Self::Resumed => "RESUMED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Progress callback: `done` is monotone non-decreasing, `total` is constant
/// across a run. Invoked from worker tasks; must not block.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, done: u64, total: u64);
}

impl<F> ProgressListener for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn on_progress(&self, done: u64, total: u64) {
        self(done, total)
    }
}

/// State callback: `message` is a short human-readable reason. Invoked from
/// worker tasks and the orchestrator; must be reentrant and non-blocking.
/// A listener may call back into the downloader (e.g. `cancel`).
pub trait StateListener: Send + Sync {
    fn on_state(&self, state: DownloadState, message: &str);
}

impl<F> StateListener for F
where
    F: Fn(DownloadState, &str) + Send + Sync,
{
    fn on_state(&self, state: DownloadState, message: &str) {
        self(state, message)
    }
}

/// Fan-in point for state notifications. Consecutive duplicates of the same
/// `(state, message)` pair are suppressed.
pub(crate) struct StateNotifier {
    listener: Option<Arc<dyn StateListener>>,
    last: Mutex<Option<(DownloadState, String)>>,
}

impl StateNotifier {
    pub(crate) fn new(listener: Option<Arc<dyn StateListener>>) -> Self {
        Self {
            listener,
            last: Mutex::new(None),
        }
    }

    /// Forget the previous notification; the next one always fires.
    pub(crate) fn reset(&self) {
        *self.last.lock() = None;
    }

    pub(crate) fn notify(&self, state: DownloadState, message: &str) {
        {
            let mut last = self.last.lock();
            if let Some((prev_state, prev_message)) = last.as_ref()
                && *prev_state == state
                && prev_message == message
            {
                return;
            }
            *last = Some((state, message.to_string()));
        }
        debug!(%state, message, "State transition");
        if let Some(listener) = &self.listener {
            listener.on_state(state, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_notifier() -> (StateNotifier, Arc<Mutex<Vec<(DownloadState, String)>>>) {
        let seen: Arc<Mutex<Vec<(DownloadState, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = move |state: DownloadState, message: &str| {
            sink.lock().push((state, message.to_string()));
        };
        (StateNotifier::new(Some(Arc::new(listener))), seen)
    }

    #[test]
    fn consecutive_duplicates_are_suppressed() {
        let (notifier, seen) = recording_notifier();
        notifier.notify(DownloadState::Started, "download started");
        notifier.notify(DownloadState::Started, "download started");
        notifier.notify(DownloadState::Paused, "download paused");
        notifier.notify(DownloadState::Paused, "download paused");
        assert_eq!(
            *seen.lock(),
            vec![
                (DownloadState::Started, "download started".to_string()),
                (DownloadState::Paused, "download paused".to_string()),
            ]
        );
    }

    #[test]
    fn same_state_with_new_message_fires() {
        let (notifier, seen) = recording_notifier();
        notifier.notify(DownloadState::Error, "first failure");
        notifier.notify(DownloadState::Error, "second failure");
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn reset_rearms_duplicate_suppression() {
        let (notifier, seen) = recording_notifier();
        notifier.notify(DownloadState::Started, "download started");
        notifier.reset();
        notifier.notify(DownloadState::Started, "download started");
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn missing_listener_is_harmless() {
        let notifier = StateNotifier::new(None);
        notifier.notify(DownloadState::Started, "download started");
        notifier.notify(DownloadState::Stopped, "downloader stopped");
    }

    #[test]
    fn display_matches_transition_names() {
        assert_eq!(DownloadState::Started.to_string(), "STARTED");
        assert_eq!(DownloadState::Stopped.to_string(), "STOPPED");
    }
}
