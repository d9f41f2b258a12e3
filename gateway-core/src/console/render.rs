//! Text rendering for console output.
//!
//! Every renderer writes through [`fmt::Write`] so front-ends can render into
//! a bounded [`Line`](super::Line) and flush it however their transport
//! requires.

use core::fmt;
use core::time::Duration;

use crate::adv_table::AdvRecord;
use crate::comm::Sink;
use crate::telemetry::{Counter, MetricsSnapshot};
use crate::status::StatusSnapshot;

/// Renders a [`StatusSnapshot`] as console lines.
#[derive(Clone, Copy, Debug)]
pub struct StatusFormatter<'a> {
    snapshot: &'a StatusSnapshot,
}

impl<'a> StatusFormatter<'a> {
    #[must_use]
    pub const fn new(snapshot: &'a StatusSnapshot) -> Self {
        Self { snapshot }
    }

    /// `relay on network=up time=synced ts=on`
    pub fn write_flags_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        let state = &self.snapshot.state;
        write!(
            writer,
            "relay {} network={} time={} ts={}",
            on_off(state.relaying_enabled),
            if state.network_connected { "up" } else { "down" },
            if state.time_synced { "synced" } else { "unsynced" },
            on_off(state.use_timestamps),
        )?;
        if state.stop {
            writer.write_str(" stopped")?;
        }
        Ok(())
    }

    /// `sink primary pending=yes last=ok`
    pub fn write_sink_line<W: fmt::Write>(&self, writer: &mut W, sink: Sink) -> fmt::Result {
        write!(
            writer,
            "sink {} pending={} last={}",
            sink,
            yes_no(self.snapshot.state.need_send(sink)),
            self.snapshot.sink(sink),
        )?;
        if self.snapshot.in_progress == Some(sink) {
            writer.write_str(" in-flight")?;
        }
        Ok(())
    }

    /// `coproc configured`
    pub fn write_link_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(writer, "coproc {}", self.snapshot.link)
    }

    /// `store 12/100 uptime=+3600.0s last-ok=+12.5s nonce=42`
    pub fn write_store_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        write!(
            writer,
            "store {}/{} uptime=",
            self.snapshot.store_len, self.snapshot.store_capacity
        )?;
        write_duration(writer, self.snapshot.uptime)?;
        writer.write_str(" last-ok=")?;
        write_duration(writer, self.snapshot.since_last_success)?;
        write!(writer, " nonce={}", self.snapshot.nonce)
    }
}

/// `AA:BB:CC:DD:EE:FF ts=1700000000 rssi=-70 samples=3 data=990403`
pub fn write_record<W: fmt::Write>(writer: &mut W, record: &AdvRecord) -> fmt::Result {
    write!(
        writer,
        "{} ts={} rssi={} samples={} data=",
        record.mac, record.timestamp, record.rssi, record.samples_counter
    )?;
    for byte in record.payload() {
        write!(writer, "{byte:02x}")?;
    }
    Ok(())
}

/// `coproc-lost-acks 3`
pub fn write_counter<W: fmt::Write>(
    writer: &mut W,
    metrics: &MetricsSnapshot,
    counter: Counter,
) -> fmt::Result {
    write!(writer, "{} {}", counter, metrics.get(counter))
}

fn write_duration<W: fmt::Write>(writer: &mut W, duration: Duration) -> fmt::Result {
    let millis = duration.as_millis();
    write!(writer, "+{}.{}s", millis / 1_000, (millis % 1_000) / 100)
}

const fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

const fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}
