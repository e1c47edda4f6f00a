//! Terminal progress output: an indicatif bar or JSON lines on stdout.

use std::io::Write;

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use streamdl_core::{DownloadState, ProgressSink, ProgressUpdate};

/// Renders updates on a progress bar.
pub(crate) struct BarProgressSink {
    bar: ProgressBar,
}

impl BarProgressSink {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }
}

impl ProgressSink for BarProgressSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        if let Some(total) = update.total_bytes {
            self.bar.set_length(total);
        }
        self.bar.set_position(update.bytes_written);

        let mut message = format!("{}/s {}", HumanBytes(update.bytes_per_second), update.state);
        if let (Some(written), Some(total)) = (update.segments_written, update.segment_total) {
            message.push_str(&format!(" segment {written}/{total}"));
        }
        self.bar.set_message(message);

        match update.state {
            DownloadState::Done => self.bar.finish(),
            DownloadState::Failed | DownloadState::Stopped => self.bar.abandon(),
            _ => {}
        }
    }
}

/// Writes each update as one JSON object per line.
pub(crate) struct JsonProgressSink;

impl ProgressSink for JsonProgressSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        if let Ok(line) = serde_json::to_string(update) {
            let mut stdout = std::io::stdout().lock();
            // A closed stdout must not abort the download.
            let _ = writeln!(stdout, "{line}");
        }
    }
}
