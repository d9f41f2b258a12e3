#![no_std]

// Portable gateway logic: advertisement store, scheduling, transfer
// orchestration and the coprocessor link.
//
// Nothing here touches hardware or the Rust standard library. The firmware and
// the host emulator supply the collaborators through the traits exposed below.

mod log;

pub mod adv_table;
pub mod comm;
pub mod config;
pub mod console;
pub mod coprocessor;
pub mod orchestrator;
pub mod signals;
pub mod status;
pub mod telemetry;
pub mod time;
pub mod timers;
