use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;

/// Long-running phases that report progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Units are variants whose window has been scanned.
    Pruning,
    /// Units are matrix rows.
    LdMatrix,
    /// Units are variants whose row of pairs is complete.
    Epistasis,
}

impl Phase {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Pruning => "LD pruning",
            Self::LdMatrix => "LD matrix",
            Self::Epistasis => "epistasis scan",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress. Only the coordinating thread calls it.
pub trait ProgressObserver {
    fn on_phase_start(&mut self, phase: Phase, total: usize) {
        let _ = (phase, total);
    }
    fn on_phase_advance(&mut self, phase: Phase, completed: usize) {
        let _ = (phase, completed);
    }
    fn on_phase_finish(&mut self, phase: Phase) {
        let _ = phase;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

/// Terminal progress bar; drawing is suppressed when stderr is not a terminal.
#[derive(Default)]
pub struct BarProgress {
    bar: Option<ProgressBar>,
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .map(|style| style.progress_chars("█▉▊▋▌▍▎▏  "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

impl ProgressObserver for BarProgress {
    fn on_phase_start(&mut self, phase: Phase, total: usize) {
        self.bar = Some(create_progress_bar(total as u64, phase.describe()));
    }

    fn on_phase_advance(&mut self, _phase: Phase, completed: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed as u64);
        }
    }

    fn on_phase_finish(&mut self, _phase: Phase) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every callback for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingProgress {
        pub(crate) events: Vec<(Phase, &'static str, usize)>,
    }

    impl ProgressObserver for RecordingProgress {
        fn on_phase_start(&mut self, phase: Phase, total: usize) {
            self.events.push((phase, "start", total));
        }
        fn on_phase_advance(&mut self, phase: Phase, completed: usize) {
            self.events.push((phase, "advance", completed));
        }
        fn on_phase_finish(&mut self, phase: Phase) {
            self.events.push((phase, "finish", 0));
        }
    }

    #[test]
    fn bar_progress_tolerates_any_callback_order() {
        let mut bar = BarProgress::default();
        bar.on_phase_advance(Phase::LdMatrix, 3);
        bar.on_phase_start(Phase::LdMatrix, 10);
        bar.on_phase_advance(Phase::LdMatrix, 7);
        bar.on_phase_finish(Phase::LdMatrix);
        bar.on_phase_finish(Phase::LdMatrix);
        assert!(bar.bar.is_none());
        assert_eq!(Phase::Epistasis.to_string(), "epistasis scan");
    }
}
