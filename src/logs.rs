//! Tagged service output.
//!
//! Each service's streaming thread pushes [`LogLine`]s onto one shared channel; a single
//! printer drains it. Lines from one service keep their order, lines from different services
//! interleave freely.
use std::{
    io::{self, BufRead, BufReader, Read, Write},
    sync::mpsc::{Receiver, Sender},
    thread,
};

use strum_macros::AsRefStr;
use tracing::debug;

/// Width of the padded service name in the log prefix.
pub const NAME_WIDTH: usize = 12;

const RESET: &str = "\x1b[0m";

/// Display colour assigned to a service's log prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Color {
    Cyan,
    Magenta,
    Yellow,
    Green,
    Blue,
    Red,
}

impl Color {
    const PALETTE: [Color; 6] = [
        Color::Cyan,
        Color::Magenta,
        Color::Yellow,
        Color::Green,
        Color::Blue,
        Color::Red,
    ];

    /// Colour for the `index`-th service, cycling through the palette.
    pub fn for_index(index: usize) -> Self {
        Self::PALETTE[index % Self::PALETTE.len()]
    }

    /// ANSI escape sequence selecting this colour.
    pub fn ansi(&self) -> &'static str {
        match self {
            Color::Cyan => "\x1b[36m",
            Color::Magenta => "\x1b[35m",
            Color::Yellow => "\x1b[33m",
            Color::Green => "\x1b[32m",
            Color::Blue => "\x1b[34m",
            Color::Red => "\x1b[31m",
        }
    }
}

/// One line of output from a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Service that emitted the line.
    pub service: String,
    /// Colour assigned to the service.
    pub color: Color,
    /// Line contents without the trailing newline.
    pub text: String,
}

impl LogLine {
    /// Renders the line with its coloured `[name]` prefix.
    pub fn render(&self) -> String {
        format!(
            "  {}[{:<width$}]{} {}",
            self.color.ansi(),
            self.service,
            RESET,
            self.text,
            width = NAME_WIDTH
        )
    }
}

/// Reads `reader` line by line and forwards each line to `sink` until the stream closes or
/// the receiving side goes away.
///
/// Read errors end the stream quietly: the process side of the pipe disappearing while
/// a stop is in flight is expected.
pub fn pump_lines<R: Read>(service: &str, color: Color, reader: R, sink: &Sender<LogLine>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                let line = LogLine {
                    service: service.to_string(),
                    color,
                    text,
                };
                if sink.send(line).is_err() {
                    debug!("Log receiver for '{service}' closed; stopping stream");
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("Output stream for '{service}' ended: {err}");
                break;
            }
        }
    }
}

/// Spawns the single consumer that writes every received line to stdout.
///
/// The thread exits once every sender has been dropped.
pub fn spawn_printer(receiver: Receiver<LogLine>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdout = io::stdout();
        for line in receiver {
            let mut out = stdout.lock();
            if writeln!(out, "{}", line.render()).is_err() {
                break;
            }
        }
    })
}
