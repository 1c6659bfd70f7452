//! Unified logging and progress UI.
//!
//! [`Notifier`] wraps `env_logger` (text logs) and `indicatif` (spinner) under a single
//! verbosity switch:
//! - [`VerbosityLevel::Quiet`] → no text logs; a live spinner shows the latest message.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`] → standard logs.
//!
//! What you get:
//! - [`Notifier::info`]/[`Notifier::debug`]/[`Notifier::warn`]/[`Notifier::trace`]: emit logs
//!   (or update the Quiet-mode spinner message for `info`).
//! - [`Notifier::progress`]: periodic entry counts while a layer is transcoded.
//! - [`Notifier::finish`]: clear the spinner once a call completes.
//! - [`Notifier::abort`]: clear the spinner and warn when a call fails or is cancelled.
//!
//! Levels map to `env_logger` filters; `RUST_LOG` is honored through `Env::default()`.

use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Record};
use std::cell::RefCell;
use std::time::Duration;

/// How often (in entries) [`Notifier::progress`] emits a line in text mode.
const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Spinner only, no text logs
    Info = 1,  // Text logs at info level
    Debug = 2, // Text logs at debug level
    Trace = 3, // Text logs at trace level
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    logger: env_logger::Logger,
    active_spinner: RefCell<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        let logger = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .build();

        Self {
            verbosity,
            logger,
            active_spinner: RefCell::new(None),
        }
    }

    fn log(&self, level: Level, message: &str) {
        self.logger.log(
            &Record::builder()
                .args(format_args!("{}", message))
                .level(level)
                .target(module_path!())
                .build(),
        );
    }

    pub fn info(&self, message: &str) {
        match self.verbosity {
            VerbosityLevel::Quiet => {
                // Lazy initialize spinner on first info call
                if self.active_spinner.borrow().is_none() {
                    let spinner = ProgressBar::new_spinner();
                    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
                        spinner.set_style(style);
                    }
                    spinner.enable_steady_tick(Duration::from_millis(100));
                    *self.active_spinner.borrow_mut() = Some(spinner);
                }

                if let Some(spinner) = self.active_spinner.borrow().as_ref() {
                    spinner.set_message(message.to_string());
                }
            }
            _ => self.log(Level::Info, message),
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(Level::Debug, message);
        }
    }

    pub fn warn(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(Level::Warn, message);
        }
    }

    pub fn trace(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            self.log(Level::Trace, message);
        }
    }

    /// Reports that `count` entries have been processed.
    pub fn progress(&self, count: u64, message: &str) {
        match self.verbosity {
            VerbosityLevel::Quiet => {
                if let Some(spinner) = self.active_spinner.borrow().as_ref() {
                    spinner.set_message(format!("{}: {}", message, count));
                }
            }
            _ if count % PROGRESS_EVERY == 0 => self.info(&format!("{}: {}", message, count)),
            _ => {}
        }
    }

    pub fn finish(&self, message: &str) {
        let spinner = self.active_spinner.borrow_mut().take();
        match spinner {
            Some(spinner) => spinner.finish_and_clear(),
            None if self.verbosity != VerbosityLevel::Quiet => self.log(Level::Info, message),
            None => {}
        }
    }

    /// Clears the spinner after a failed or cancelled call and reports why.
    pub fn abort(&self, message: &str) {
        if let Some(spinner) = self.active_spinner.borrow_mut().take() {
            spinner.finish_and_clear();
        }
        self.warn(message);
    }

    pub fn is_spinning(&self) -> bool {
        self.active_spinner.borrow().is_some()
    }

    pub fn verbosity_level(&self) -> VerbosityLevel {
        self.verbosity
    }
}
