//! Transfer progress display with progress bars.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wisp_core::driver::StatusFn;
use wisp_core::worker::ProgressSender;
use wisp_core::{SessionId, TransferProgress};

const BAR_TEMPLATE: &str = "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// One progress bar per session, fed from the workers' progress channel
pub struct ProgressDisplay {
    multi: MultiProgress,
    task: JoinHandle<()>,
}

impl ProgressDisplay {
    /// Start the display. Bars are labelled with `label` and the session id.
    #[must_use]
    pub fn start(label: &str) -> (Self, ProgressSender) {
        let multi = MultiProgress::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<TransferProgress>();

        let bars_multi = multi.clone();
        let label = label.to_string();
        let task = tokio::spawn(async move {
            let mut bars: HashMap<SessionId, ProgressBar> = HashMap::new();
            while let Some(update) = rx.recv().await {
                let bar = bars.entry(update.sid.clone()).or_insert_with(|| {
                    let bar = bars_multi.add(ProgressBar::new(update.total));
                    bar.set_style(bar_style());
                    bar.set_message(format!("{label} [{}]", update.sid.short()));
                    bar
                });
                bar.set_position(update.bytes);
                if update.bytes >= update.total {
                    bar.finish();
                }
            }

            for bar in bars.values().filter(|bar| !bar.is_finished()) {
                bar.abandon();
            }
        });

        (Self { multi, task }, tx)
    }

    /// Status sink that prints above the bars
    #[must_use]
    pub fn status_fn(&self) -> StatusFn {
        let multi = self.multi.clone();
        Arc::new(move |line: &str| {
            if multi.is_hidden() || multi.println(line).is_err() {
                println!("{line}");
            }
        })
    }

    /// Wait for the display to drain once every sender is gone
    pub async fn finish(self) {
        let _ = self.task.await;
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
