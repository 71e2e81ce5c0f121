use std::io::{self, Write};

use spinners_rs::{Spinner, Spinners};

// ESEQ is for "escape sequence"
pub const ESEQ_DELETE_LINE: &str = "\x1b[0J";
pub const ESEQ_RED: &str = "\x1b[38;5;1m";
pub const ESEQ_GREEN: &str = "\x1b[38;5;2m";
pub const ESEQ_RESET: &str = "\x1b[m";

pub const SPINNER_MS: u64 = 50;

/// Where remote output and progress lines end up
pub trait Console: Send + Sync {
    fn stdout(&self) -> Box<dyn Write + Send>;
    fn stderr(&self) -> Box<dyn Write + Send>;
}

/// The process's own stdout and stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsole;

impl Console for StdConsole {
    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(io::stdout())
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(io::stderr())
    }
}

/// Byte counters of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferState {
    pub total_bytes: u64,
    pub copied_bytes: u64,
}

impl TransferState {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            copied_bytes: 0,
        }
    }

    /// Records `bytes` more as written and returns the new percentage
    pub fn advance(&mut self, bytes: usize) -> f64 {
        self.copied_bytes += bytes as u64;
        self.percent()
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }

        self.copied_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Percentage indicator redrawn in place on a single line
pub struct ProgressLine<W: Write> {
    out: W,
    label: String,
    drawn: bool,
}

impl<W: Write> ProgressLine<W> {
    pub fn new(out: W, label: impl ToString) -> Self {
        Self {
            out,
            label: label.to_string(),
            drawn: false,
        }
    }

    pub fn render(&mut self, percent: f64) -> io::Result<()> {
        self.drawn = true;
        write!(self.out, "\r{}: {:.2}%", self.label, percent)?;
        self.out.flush()
    }

    /// Ends the line so following output starts below it
    pub fn finish(&mut self) -> io::Result<()> {
        if self.drawn {
            writeln!(self.out)?;
        }
        self.out.flush()
    }
}

pub struct ProgressView {
    task: String,
    spinner: Spinner,
}

impl ProgressView {
    pub fn new(task: impl ToString) -> Self {
        let mut spinner = Spinner::new(Spinners::BouncingBar, task.to_string());
        spinner.set_interval(SPINNER_MS);

        Self {
            task: task.to_string(),
            spinner,
        }
    }

    /// Spins while `func` runs and stops with a mark telling how it went
    pub async fn with<T, E, F>(task: impl ToString, func: F) -> Result<T, E>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut view = Self::new(task);
        view.start();

        let result = func.await;
        match &result {
            Ok(_) => view.success(None),
            Err(err) => view.failure(Some(&err.to_string())),
        }

        result
    }

    pub fn start(&mut self) {
        self.spinner.start();
    }

    pub fn success(&mut self, message: Option<&str>) {
        self.spinner.stop_with_message(format!(
            "{ESEQ_DELETE_LINE}{ESEQ_GREEN}✓ {}{}{ESEQ_RESET}",
            self.task,
            message
                .map(|message| format!(" - {}", message))
                .unwrap_or("".to_owned())
        ));
        println!();
    }

    pub fn failure(&mut self, message: Option<&str>) {
        self.spinner.stop_with_message(format!(
            "{ESEQ_DELETE_LINE}{ESEQ_RED}! {}{}{ESEQ_RESET}",
            self.task,
            message
                .map(|message| format!(" - {}", message))
                .unwrap_or("".to_owned())
        ));
        println!();
    }
}
