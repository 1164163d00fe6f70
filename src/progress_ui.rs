//! Terminal progress bar fed by engine progress snapshots.

use std::sync::Arc;

use funget::ProgressObserver;
use funget::ProgressSnapshot;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{spinner} {msg} {bytes} ({bytes_per_sec})";

/// Progress bar that implements [`ProgressObserver`].
///
/// Starts as a spinner and switches to a bar once a total is known.
#[derive(Debug, Clone)]
pub(crate) struct ProgressUi {
    bar: ProgressBar,
}

impl ProgressUi {
    /// Creates a visible bar, or a hidden one when `enabled` is false.
    pub(crate) fn new(enabled: bool, label: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        if enabled {
            bar.set_style(
                ProgressStyle::with_template(SPINNER_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// Observer handle to pass to the downloader or uploader.
    pub(crate) fn observer(&self) -> Arc<dyn ProgressObserver> {
        Arc::new(self.clone())
    }

    /// Removes the bar from the terminal.
    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }

    #[cfg(test)]
    fn position(&self) -> u64 {
        self.bar.position()
    }

    #[cfg(test)]
    fn length(&self) -> Option<u64> {
        self.bar.length()
    }
}

impl ProgressObserver for ProgressUi {
    fn on_progress(&self, snapshot: ProgressSnapshot) {
        if let Some(total) = snapshot.total_bytes
            && self.bar.length() != Some(total)
        {
            self.bar.set_length(total);
            self.bar.set_style(
                ProgressStyle::with_template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
        }
        self.bar.set_position(snapshot.bytes_transferred);
    }
}
