use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::flow::Event;
use crate::lifecycle::{LifecycleState, Transition};

/// Controls how boot progress is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Progress bars, no log lines on the terminal.
    Normal,
    /// Progress bars plus debug logs on stderr.
    Verbose,
    /// Final outcome only.
    Quiet,
    /// No ANSI, plain println output (for piped/non-TTY).
    Plain,
}

impl OutputMode {
    pub fn resolve(verbose: bool, quiet: bool) -> Self {
        if quiet {
            OutputMode::Quiet
        } else if !std::io::stderr().is_terminal() {
            OutputMode::Plain
        } else if verbose {
            OutputMode::Verbose
        } else {
            OutputMode::Normal
        }
    }
}

/// Bar resolution: fractions are shown in tenths of a percent.
const PERMILLE: u64 = 1000;

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    style("{spinner:.cyan} {msg:<22} [{bar:30.cyan/blue}] {percent:>3}%").progress_chars("=> ")
}

fn done_style() -> ProgressStyle {
    style("\u{2713} {msg:.green}")
}

fn failed_style() -> ProgressStyle {
    style("\u{2717} {msg:.red}")
}

/// The stage currently on screen and the task feeding its bar.
struct Stage {
    bar: ProgressBar,
    label: &'static str,
    follower: JoinHandle<()>,
}

/// Renders lifecycle transitions of one `boot` as a bar per stage, fed by
/// the instance's download and install progress channels.
pub struct LifecycleProgress {
    multi: MultiProgress,
    mode: OutputMode,
    download: watch::Receiver<f64>,
    install: watch::Receiver<f64>,
    stage: Option<Stage>,
}

impl LifecycleProgress {
    pub fn new(mode: OutputMode, download: watch::Receiver<f64>, install: watch::Receiver<f64>) -> Self {
        let multi = match mode {
            OutputMode::Normal | OutputMode::Verbose => MultiProgress::new(),
            OutputMode::Quiet | OutputMode::Plain => {
                MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
            }
        };
        Self {
            multi,
            mode,
            download,
            install,
            stage: None,
        }
    }

    /// Label of the stage being shown, if any.
    pub fn current_stage(&self) -> Option<&'static str> {
        self.stage.as_ref().map(|s| s.label)
    }

    pub fn on_transition(&mut self, t: &Transition) {
        if let Event::Failed { stage, message } = &t.event {
            self.end_stage(false);
            self.println(&format!("\u{2717} {stage} failed: {message}"));
            return;
        }
        if !t.is_change() {
            return;
        }

        match t.new_state {
            LifecycleState::DownloadingInstaller => {
                self.end_stage(true);
                self.begin("downloading installer", self.download.clone());
            }
            LifecycleState::InstallingOs => {
                self.end_stage(true);
                self.begin("installing", self.install.clone());
            }
            LifecycleState::Running => {
                self.end_stage(true);
                self.println("\u{2713} running");
            }
            LifecycleState::Unknown if t.old_state == LifecycleState::DownloadingInstaller => {
                self.end_stage(false);
                self.println("download cancelled");
            }
            // Errors arrive with a `Failed` event, handled above.
            LifecycleState::Unknown | LifecycleState::Error => {}
        }
    }

    /// Print a line above the bars.
    pub fn println(&self, text: &str) {
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Plain => println!("{text}"),
            OutputMode::Normal | OutputMode::Verbose => {
                self.multi.println(text).ok();
            }
        }
    }

    /// Print an indented info line (console, VNC port, ...).
    pub fn info(&self, text: &str) {
        self.println(&format!("  \u{2192} {text}"));
    }

    fn begin(&mut self, label: &'static str, mut progress: watch::Receiver<f64>) {
        if self.mode == OutputMode::Plain {
            println!("{label}...");
        }

        let bar = self.multi.add(ProgressBar::new(PERMILLE));
        bar.set_style(bar_style());
        bar.set_message(label);
        bar.enable_steady_tick(Duration::from_millis(80));

        let follower = {
            let bar = bar.clone();
            tokio::spawn(async move {
                loop {
                    let fraction = *progress.borrow_and_update();
                    bar.set_position((fraction.clamp(0.0, 1.0) * PERMILLE as f64) as u64);
                    if progress.changed().await.is_err() {
                        break;
                    }
                }
            })
        };

        self.stage = Some(Stage {
            bar,
            label,
            follower,
        });
    }

    fn end_stage(&mut self, ok: bool) {
        let Some(stage) = self.stage.take() else {
            return;
        };
        stage.follower.abort();
        if ok {
            if self.mode == OutputMode::Plain {
                println!("\u{2713} {}", stage.label);
            }
            stage.bar.set_style(done_style());
            stage.bar.finish_with_message(stage.label);
        } else {
            stage.bar.set_style(failed_style());
            stage.bar.abandon_with_message(stage.label);
        }
    }
}

impl Drop for LifecycleProgress {
    fn drop(&mut self) {
        if let Some(stage) = self.stage.take() {
            stage.follower.abort();
            stage.bar.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Stage as FlowStage;
    use std::path::PathBuf;

    fn transition(old: LifecycleState, new: LifecycleState, event: Event) -> Transition {
        Transition::new(old, new, event)
    }

    fn progress() -> (watch::Sender<f64>, watch::Sender<f64>, LifecycleProgress) {
        let (download_tx, download_rx) = watch::channel(0.0);
        let (install_tx, install_rx) = watch::channel(0.0);
        let progress = LifecycleProgress::new(OutputMode::Quiet, download_rx, install_rx);
        (download_tx, install_tx, progress)
    }

    #[tokio::test]
    async fn stages_follow_transitions() {
        use LifecycleState::*;
        let (_d, _i, mut p) = progress();

        p.on_transition(&transition(Unknown, Unknown, Event::Started { hardware_model_present: false }));
        assert_eq!(p.current_stage(), None);

        p.on_transition(&transition(Unknown, DownloadingInstaller, Event::ImageMissing));
        assert_eq!(p.current_stage(), Some("downloading installer"));

        p.on_transition(&transition(
            DownloadingInstaller,
            InstallingOs,
            Event::ImageDownloaded(PathBuf::from("/vm/restore.iso")),
        ));
        assert_eq!(p.current_stage(), Some("installing"));

        p.on_transition(&transition(InstallingOs, Running, Event::SessionStarted));
        assert_eq!(p.current_stage(), None);
    }

    #[tokio::test]
    async fn cancel_and_failure_clear_the_stage() {
        use LifecycleState::*;
        let (_d, _i, mut p) = progress();

        p.on_transition(&transition(Unknown, DownloadingInstaller, Event::ImageMissing));
        p.on_transition(&transition(DownloadingInstaller, Unknown, Event::CancelDownload));
        assert_eq!(p.current_stage(), None);

        p.on_transition(&transition(Unknown, DownloadingInstaller, Event::ImageMissing));
        p.on_transition(&transition(
            DownloadingInstaller,
            Error,
            Event::Failed {
                stage: FlowStage::Download,
                message: "connection reset".into(),
            },
        ));
        assert_eq!(p.current_stage(), None);
    }

    #[tokio::test]
    async fn bar_tracks_progress_channel() {
        use LifecycleState::*;
        let (download, _i, mut p) = progress();

        p.on_transition(&transition(Unknown, DownloadingInstaller, Event::ImageMissing));
        download.send_replace(0.5);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let position = p.stage.as_ref().map(|s| s.bar.position());
        assert_eq!(position, Some(500));
    }
}
