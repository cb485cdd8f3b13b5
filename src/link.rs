//! The byte channel to the bootloader: a buffered, line-oriented read side
//! and a raw write side.

use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::time::Duration;

use log::{debug, trace};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{Error, OurContext};

/// Shown by the bootloader whenever it is back at its idle prompt.
const PROMPT: &[u8] = b"Command";
/// The full prompt. If the stream has this, the leading "Enter " is part of
/// the marker rather than output.
const PROMPT_PREFIX: &[u8] = b"Enter ";
/// Substring the bootloader puts in any line reporting a failure.
const ERROR_MARKER: &str = "ERROR";

/// One line of bootloader output, classified.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    Ok(String),
    Error(String),
}

impl Reply {
    pub fn classify(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.contains(ERROR_MARKER) {
            Reply::Error(text)
        } else {
            Reply::Ok(text)
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Reply::Ok(t) | Reply::Error(t) => t,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Turns an error reply into [`Error::Device`].
    pub fn check(self) -> Result<String, Error> {
        match self {
            Reply::Ok(text) => Ok(text),
            Reply::Error(text) => Err(Error::Device(text)),
        }
    }
}

/// What a drain saw on its way to the prompt.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Drained {
    /// Bytes forwarded to the sink, not counting the prompt marker.
    pub bytes: u64,
    pub prompt_seen: bool,
    /// First line containing "ERROR", if any.
    pub error: Option<String>,
}

impl Drained {
    pub fn check(self) -> Result<Self, Error> {
        match self.error {
            Some(text) => Err(Error::Device(text)),
            None => Ok(self),
        }
    }
}

pub struct Link<R, W> {
    input: BufReader<R>,
    output: W,
}

/// A link over a physical serial port.
pub type SerialLink = Link<Box<dyn SerialPort>, Box<dyn SerialPort>>;

impl SerialLink {
    /// Opens `path` at 8N1 with no flow control.
    ///
    /// `read_timeout` is how long the link waits before deciding the device
    /// has nothing more to say during a drain. Reply reads keep waiting
    /// through it.
    pub fn open_serial(path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self, Error> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()
            .with_context(|| format!("opening serial port {path}"))?;

        port.clear(ClearBuffer::Input)
            .context("resetting serial input buffer")?;

        let reader = port.try_clone()
            .context("cloning serial port handle for reading")?;

        debug!("opened {path} at {baud_rate} baud");
        Ok(Link::new(reader, port))
    }
}

impl Link<io::Stdin, io::Stdout> {
    /// Talks to whatever is on the other end of stdin/stdout, for exercising
    /// the protocol without hardware.
    pub fn local() -> Self {
        Link::new(io::stdin(), io::stdout())
    }
}

impl<R: Read, W: Write> Link<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Link {
            input: BufReader::new(input),
            output,
        }
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    /// Writes a command as-is, with no terminator.
    pub fn write_command(&mut self, command: &[u8]) -> Result<(), Error> {
        trace!("-> {:?}", String::from_utf8_lossy(command));
        self.output.write_all(command)?;
        self.output.flush()?;
        Ok(())
    }

    /// Writes `data` and a newline, then gives the device `settle` to chew on
    /// it. The bootloader has no flow control, so this pause is all that
    /// keeps us from overrunning it.
    pub fn write_line(&mut self, data: &str, settle: Duration) -> Result<(), Error> {
        trace!("-> {data:?}");
        self.output.write_all(data.as_bytes())?;
        self.output.write_all(b"\n")?;
        self.output.flush()?;
        if !settle.is_zero() {
            std::thread::sleep(settle);
        }
        Ok(())
    }

    /// Reads one line of device output, without its terminator. End of input
    /// gives an empty `Ok` reply; whether that matters is up to the caller.
    pub fn read_reply(&mut self) -> Result<Reply, Error> {
        let mut line = Vec::new();
        loop {
            match self.input.read_until(b'\n', &mut line) {
                Ok(_) => break,
                // read_until keeps what it got before the timeout in `line`.
                Err(e) if is_idle(&e) || e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("reading reply from device"),
            }
        }
        while matches!(line.last(), Some(&(b'\n' | b'\r'))) {
            line.pop();
        }
        let reply = Reply::classify(String::from_utf8_lossy(&line));
        trace!("<- {:?}", reply.text());
        Ok(reply)
    }

    /// Discards device output up to the prompt.
    pub fn drain(&mut self) -> Result<Drained, Error> {
        self.drain_to(&mut io::sink())
    }

    /// Copies device output into `sink` until the prompt shows up or the
    /// device goes quiet.
    ///
    /// Everything before the prompt marker is forwarded; the marker itself is
    /// consumed and anything after it stays buffered for the next read.
    pub fn drain_to(&mut self, sink: &mut dyn Write) -> Result<Drained, Error> {
        // Poke the device, so a bootloader idling at its prompt says
        // something.
        self.write_line("", Duration::ZERO)?;

        let mut drained = Drained::default();
        let mut lines = LineScanner::default();
        // Bytes read but not yet forwarded, held back in case they are the
        // start of a prompt that the next read completes.
        let mut pending: Vec<u8> = Vec::new();
        let hold_back = PROMPT_PREFIX.len() + PROMPT.len() - 1;

        loop {
            let chunk = match self.input.fill_buf() {
                Ok(chunk) => chunk,
                Err(e) if is_idle(&e) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("draining device output"),
            };
            if chunk.is_empty() {
                break;
            }

            let carried = pending.len();
            let n = chunk.len();
            pending.extend_from_slice(chunk);

            if let Some((start, end)) = find_prompt(&pending) {
                // A marker wholly inside the held-back bytes would have been
                // found on the previous pass, so `end` lies in this chunk.
                self.input.consume(end - carried);
                lines.feed(&pending[..start]);
                sink.write_all(&pending[..start])?;
                drained.bytes += start as u64;
                drained.prompt_seen = true;
                pending.clear();
                break;
            }

            self.input.consume(n);

            let flush = pending.len().saturating_sub(hold_back);
            lines.feed(&pending[..flush]);
            sink.write_all(&pending[..flush])?;
            drained.bytes += flush as u64;
            pending.drain(..flush);
        }

        lines.feed(&pending);
        sink.write_all(&pending)?;
        sink.flush()?;
        drained.bytes += pending.len() as u64;
        drained.error = lines.finish();

        debug!(
            "drained {} bytes (prompt {})",
            drained.bytes,
            if drained.prompt_seen { "seen" } else { "not seen" },
        );
        Ok(drained)
    }
}

/// Read failures that just mean "nothing more right now".
fn is_idle(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

/// Finds the prompt in `buf`, returning the range the marker covers.
fn find_prompt(buf: &[u8]) -> Option<(usize, usize)> {
    let pos = buf.windows(PROMPT.len()).position(|w| w == PROMPT)?;
    let end = pos + PROMPT.len();
    let start = match pos.checked_sub(PROMPT_PREFIX.len()) {
        Some(s) if &buf[s..pos] == PROMPT_PREFIX => s,
        _ => pos,
    };
    Some((start, end))
}

/// Splits a byte stream into lines and remembers the first one reporting an
/// error.
#[derive(Default)]
struct LineScanner {
    line: Vec<u8>,
    error: Option<String>,
}

impl LineScanner {
    fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\n' {
                self.end_line();
            } else {
                self.line.push(b);
            }
        }
    }

    fn end_line(&mut self) {
        if self.error.is_none() {
            if let Reply::Error(text) = Reply::classify(String::from_utf8_lossy(&self.line)) {
                self.error = Some(text.trim_end_matches('\r').to_string());
            }
        }
        self.line.clear();
    }

    fn finish(mut self) -> Option<String> {
        self.end_line();
        self.error
    }
}
