//! Diagnostics console shared by the firmware and the emulator.
//!
//! A front-end feeds one line at a time to [`Console::execute`] and forwards
//! every rendered [`Line`] to its transport. Live data and side effects go
//! through [`ConsoleBackend`].

pub mod catalog;
pub mod grammar;
pub mod render;

use core::fmt::{self, Write as _};

use heapless::String;

use crate::adv_table::{AdvRecord, HistoryFilter};
use crate::comm::Sink;
use crate::signals::Signal;
use crate::status::StatusSnapshot;
use crate::telemetry::{Counter, MetricsSnapshot};

use self::grammar::{Command, CoprocCommand, HelpCommand, ParseError};
use self::render::StatusFormatter;

/// Longest rendered output line.
pub const MAX_LINE_LEN: usize = 128;

/// One rendered output line, without terminator.
pub type Line = String<MAX_LINE_LEN>;

/// Live data and side effects behind the console.
pub trait ConsoleBackend {
    fn status(&self) -> StatusSnapshot;

    /// Lends every live record accepted by `filter` to `visit`, newest first.
    fn history(&self, filter: HistoryFilter, visit: &mut dyn FnMut(&AdvRecord));

    fn metrics(&self) -> MetricsSnapshot;

    /// Persists the relaying switch in the gateway settings.
    fn set_relaying(&mut self, enabled: bool);

    fn post(&self, signal: Signal);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleError<'a> {
    Parse(ParseError<'a>),
    UnknownTopic(&'a str),
    /// A rendered line did not fit into [`Line`].
    LineOverflow,
}

impl fmt::Display for ConsoleError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleError::Parse(err) => err.fmt(f),
            ConsoleError::UnknownTopic(topic) => write!(f, "no help for `{topic}`"),
            ConsoleError::LineOverflow => f.write_str("output line too long"),
        }
    }
}

impl<'a> From<ParseError<'a>> for ConsoleError<'a> {
    fn from(error: ParseError<'a>) -> Self {
        Self::Parse(error)
    }
}

/// Parses console lines and executes them against a backend.
pub struct Console<B> {
    backend: B,
}

impl<B> Console<B> {
    pub const fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_inner(self) -> B {
        self.backend
    }
}

impl<B: ConsoleBackend> Console<B> {
    /// Parses and executes one line, handing each output line to `emit`.
    ///
    /// Blank lines are ignored.
    pub fn execute<'a>(
        &mut self,
        line: &'a str,
        emit: &mut dyn FnMut(&str),
    ) -> Result<(), ConsoleError<'a>> {
        if line.trim().is_empty() {
            return Ok(());
        }
        match grammar::parse(line)? {
            Command::Status => self.status(emit),
            Command::History(filter) => self.history(filter, emit),
            Command::Stats => {
                let metrics = self.backend.metrics();
                for counter in Counter::ALL {
                    emit_line(emit, |out| render::write_counter(out, &metrics, counter))?;
                }
                Ok(())
            }
            Command::Relay(enabled) => {
                self.backend.set_relaying(enabled);
                self.backend.post(Signal::RelayingModeChanged);
                emit(if enabled { "relaying on" } else { "relaying off" });
                Ok(())
            }
            Command::Coproc(CoprocCommand::Reconfigure) => {
                self.backend.post(Signal::CoprocessorCfgUpdate);
                emit("coprocessor reconfiguration requested");
                Ok(())
            }
            Command::Help(HelpCommand { topic }) => help(topic, emit),
        }
    }

    fn status(&self, emit: &mut dyn FnMut(&str)) -> Result<(), ConsoleError<'static>> {
        let snapshot = self.backend.status();
        let formatter = StatusFormatter::new(&snapshot);
        emit_line(emit, |out| formatter.write_flags_line(out))?;
        for sink in Sink::PRIORITY {
            emit_line(emit, |out| formatter.write_sink_line(out, sink))?;
        }
        emit_line(emit, |out| formatter.write_link_line(out))?;
        emit_line(emit, |out| formatter.write_store_line(out))
    }

    fn history(
        &self,
        filter: HistoryFilter,
        emit: &mut dyn FnMut(&str),
    ) -> Result<(), ConsoleError<'static>> {
        let mut count = 0usize;
        let mut result = Ok(());
        self.backend.history(filter, &mut |record| {
            if result.is_ok() {
                result = emit_line(emit, |out| render::write_record(out, record));
                count += 1;
            }
        });
        result?;
        emit_line(emit, |out| write!(out, "{count} record(s)"))
    }
}

fn help<'a>(topic: Option<&'a str>, emit: &mut dyn FnMut(&str)) -> Result<(), ConsoleError<'a>> {
    match topic {
        None => {
            for spec in catalog::commands() {
                emit_line(emit, |out| write!(out, "{:<44} {}", spec.usage, spec.summary))?;
            }
            Ok(())
        }
        Some(topic) => {
            let spec = catalog::find(topic).ok_or(ConsoleError::UnknownTopic(topic))?;
            emit_line(emit, |out| write!(out, "usage: {}", spec.usage))?;
            emit(spec.summary);
            Ok(())
        }
    }
}

fn emit_line(
    emit: &mut dyn FnMut(&str),
    render: impl FnOnce(&mut Line) -> fmt::Result,
) -> Result<(), ConsoleError<'static>> {
    let mut line = Line::new();
    render(&mut line).map_err(|_| ConsoleError::LineOverflow)?;
    emit(&line);
    Ok(())
}
