#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(target_os = "none", allow(static_mut_refs))]
#![cfg_attr(not(target_os = "none"), allow(dead_code))]

mod clock;
mod console;
mod line;
mod log;
mod shared;
mod signal;
mod status;
mod transport;
mod uplink;

#[cfg(target_os = "none")]
mod panic;
#[cfg(target_os = "none")]
mod runtime;
#[cfg(target_os = "none")]
mod usb;

#[cfg(not(target_os = "none"))]
fn main() {}
