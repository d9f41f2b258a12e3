use std::io;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;
#[allow(dead_code)]
#[path = "../sim.rs"]
mod sim;

use session::{Session, TranscriptLogger, TranscriptProfile};
use sim::GatewayState;

fn main() -> io::Result<()> {
    record_profile(TranscriptProfile::Relay)?;
    record_profile(TranscriptProfile::Coprocessor)?;
    record_profile(TranscriptProfile::Bus)?;
    Ok(())
}

fn record_profile(profile: TranscriptProfile) -> io::Result<()> {
    let gateway = GatewayState::new();
    let transcript = TranscriptLogger::for_profile(profile)?;
    let mut session = Session::new(&gateway, Some(transcript));
    let script: &[&str] = match profile {
        TranscriptProfile::Relay => &[
            "status",
            "sim net up",
            "sim time 1700000000",
            "sim adv C0:00:00:00:00:01 -60 99040512",
            "sim adv C0:00:00:00:00:02 -71 99040513",
            "history",
            "sim advance 15s",
            "sim http manual",
            "sim adv C0:00:00:00:00:01 -58 99040514",
            "sim advance 10s",
            "sim http err status 503",
            "sim advance 70s",
            "sim http ok 200 rate=30",
            "stats",
            "status",
        ],
        TranscriptProfile::Coprocessor => &[
            "sim advance 5s",
            "status",
            "sim coproc ack off",
            "coproc reconfigure",
            "sim advance 2m",
            "sim coproc ack on",
            "sim advance 10s",
            "sim coproc reboot",
            "status",
            "stats",
        ],
        TranscriptProfile::Bus => &[
            "sim cfg bus on",
            "sim cfg bus-interval 30s",
            "sim cfg primary off",
            "sim net up",
            "sim time 1700000000",
            "sim bus up",
            "sim adv C0:00:00:00:00:03 -66 990405AA",
            "sim advance 35s",
            "sim sent",
            "sim bus down",
            "sim advance 35s",
            "status",
        ],
    };
    for line in script {
        let _ = session.handle_command(line)?;
    }
    Ok(())
}
