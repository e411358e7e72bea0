//! An implementation of [`System`] which writes everything to standard output.

use std::io::{self, Write};
use std::cell::Cell;

use crate::runtime::*;

/// A [`System`] which prints speech bubbles, debug output and (optionally) sprite changes to stdout.
///
/// Output is written as one line per event in the form `sprite > message`.
#[derive(Debug, Default)]
pub struct StdSystem {
    /// Also print pen commands and sprite changes.
    pub verbose: bool,
    frames: Cell<u64>,
}
impl StdSystem {
    pub fn new(verbose: bool) -> Self {
        Self { verbose, frames: Cell::new(0) }
    }
    /// The number of frames drawn so far.
    pub fn frames(&self) -> u64 {
        self.frames.get()
    }
    fn print(&self, args: std::fmt::Arguments) {
        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{args}") {
            tracing::warn!(error = %e, "failed to write to stdout");
        }
    }
}
impl System for StdSystem {
    fn say(&self, target: &str, kind: BubbleKind, message: &Value) {
        let message = message.to_compact_string();
        match kind {
            BubbleKind::Say => self.print(format_args!("{target} > {message}")),
            BubbleKind::Think => self.print(format_args!("{target} . o O ( {message} )")),
        }
    }
    fn log(&self, value: &Value) {
        self.print(format_args!("log: {}", value.to_compact_string()));
    }
    fn assert(&self, value: &Value) {
        if !value.to_bool() {
            self.print(format_args!("assertion failed: {}", value.to_compact_string()));
        }
    }
    fn pen(&self, command: PenCommand) {
        if self.verbose {
            self.print(format_args!("pen: {command:?}"));
        }
    }
    fn sprite_changed(&self, target: &str, change: SpriteChange) {
        if self.verbose {
            self.print(format_args!("{target} : {change:?}"));
        }
    }
    fn draw(&self) {
        self.frames.set(self.frames.get() + 1);
    }
}
