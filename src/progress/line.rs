use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::{ProgressObserver, Snapshot};

const LINE_TEMPLATE: &str = "{bar:30.cyan/blue} {pos:>3}% {wide_msg}";

const BAR_CHARS: &str = "█▓▒░  ";

/// Renders snapshots on one stderr progress line.
///
/// A bar is created on the first snapshot of a stage and finished (leaving
/// its last state followed by a newline) by [`ProgressObserver::finish`].
/// Rate limiting stays with [`super::ProgressState`].
#[derive(Default)]
pub struct LineObserver {
    bar:    Option<ProgressBar>,
    hidden: bool,
}

impl LineObserver {
    pub fn stderr() -> Self {
        Self { bar: None, hidden: false }
    }

    /// Tracks snapshots without drawing anything.
    pub fn hidden() -> Self {
        Self { bar: None, hidden: true }
    }

    /// Percent shown by the active bar.
    pub fn position(&self) -> Option<u64> {
        self.bar.as_ref().map(ProgressBar::position)
    }

    /// Status shown by the active bar.
    pub fn message(&self) -> Option<String> {
        self.bar.as_ref().map(ProgressBar::message)
    }

    fn bar(&mut self) -> &ProgressBar {
        let hidden = self.hidden;
        self.bar.get_or_insert_with(|| {
            let target = if hidden {
                ProgressDrawTarget::hidden()
            } else {
                ProgressDrawTarget::stderr()
            };
            let bar = ProgressBar::with_draw_target(Some(100), target);
            if let Ok(style) = ProgressStyle::with_template(LINE_TEMPLATE) {
                bar.set_style(style.progress_chars(BAR_CHARS));
            }
            bar
        })
    }
}

impl ProgressObserver for LineObserver {
    fn on_progress(&mut self, snapshot: &Snapshot) {
        let bar = self.bar();
        bar.set_position(u64::from(snapshot.percent));
        bar.set_message(snapshot.status.clone());
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(percent: u8, status: &str) -> Snapshot {
        Snapshot { percent, status: status.into() }
    }

    #[test]
    fn bar_follows_latest_snapshot() {
        let mut obs = LineObserver::hidden();
        assert_eq!(obs.position(), None);

        obs.on_progress(&snap(5, "long-entry-name.bin"));
        obs.on_progress(&snap(40, "a"));
        assert_eq!(obs.position(), Some(40));
        assert_eq!(obs.message().as_deref(), Some("a"));
    }

    #[test]
    fn finish_closes_the_stage_bar() {
        let mut obs = LineObserver::hidden();
        obs.on_progress(&snap(100, "done"));
        obs.finish();
        assert_eq!(obs.position(), None);

        // A later stage draws a fresh bar.
        obs.on_progress(&snap(10, "next"));
        assert_eq!(obs.position(), Some(10));
    }

    #[test]
    fn finish_without_output_is_a_no_op() {
        let mut obs = LineObserver::hidden();
        obs.finish();
        assert_eq!(obs.position(), None);
    }
}
