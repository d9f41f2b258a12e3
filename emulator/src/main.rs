mod session;
mod sim;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use crossterm::style::Stylize;
use crossterm::tty::IsTty;

use session::{Reply, Session, Tone, TranscriptLogger, TranscriptProfile};
use sim::GatewayState;

fn main() -> io::Result<()> {
    let transcript = parse_transcript().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!(
            "Usage: gateway-emulator [--profile <relay|coprocessor|bus>] [--transcript <path>]"
        );
        process::exit(2);
    });
    let transcript = transcript
        .map(|(path, header)| TranscriptLogger::create(&path, &header))
        .transpose()?;

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let styled = stdout.is_tty();
    let mut writer = stdout.lock();

    let gateway = GatewayState::new();
    let mut session = Session::new(&gateway, transcript);
    let mut line = String::new();

    writeln!(
        writer,
        "Gateway Emulator ready. Type `help` for console commands, `sim help` for simulation, or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for reply in session.handle_command(trimmed)? {
            write_reply(&mut writer, &reply, styled)?;
        }
    }

    Ok(())
}

fn write_reply(writer: &mut impl Write, reply: &Reply, styled: bool) -> io::Result<()> {
    let text = reply.text.as_str();
    if !styled {
        return writeln!(writer, "{text}");
    }
    match reply.tone {
        Tone::Console => writeln!(writer, "{text}"),
        Tone::Event => writeln!(writer, "{}", text.cyan()),
        Tone::Error => writeln!(writer, "{}", text.red().bold()),
    }
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

/// Transcript destination and header chosen on the command line.
fn parse_transcript() -> Result<Option<(PathBuf, String)>, String> {
    let mut args = env::args().skip(1);
    let mut transcript = None;
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_owned(), Some(value.to_owned())),
            None => (arg.clone(), None),
        };
        let value = match inline {
            Some(value) => value,
            None => args
                .next()
                .ok_or_else(|| format!("Expected value after {flag}"))?,
        };
        transcript = Some(match flag.as_str() {
            "--profile" => {
                let profile = TranscriptProfile::from_tag(&value)?;
                (PathBuf::from(profile.log_path()), profile.header().to_owned())
            }
            "--transcript" => (
                PathBuf::from(value),
                "Gateway Emulator session transcript".to_owned(),
            ),
            other => return Err(format!("Unknown argument `{other}`")),
        });
    }
    Ok(transcript)
}
