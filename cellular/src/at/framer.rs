use core::fmt::Display;

#[cfg(feature = "defmt")]
use defmt::{debug, warn};
use heapless::{String, Vec};
#[cfg(not(feature = "defmt"))]
use log::{debug, warn};

use crate::at::response::{AT_COMMAND_SIZE, AT_LINE_SIZE};
use crate::error::Error;

const CME_TEXT_LEN: usize = 40;

/// How incoming bytes are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportMode {
    /// Modem is powered off, incoming bytes are discarded.
    Down,
    /// Bytes are framed into echoes, response lines and URCs.
    AtCommand,
    /// Bytes are raw payload of an established session.
    Transparent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseState {
    Idle,
    AwaitingEcho,
    AwaitingResponse,
    AwaitingUnsolicited,
    AwaitingRawBlock,
}

/// Terminal classification of a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AtOutcome {
    Ok,
    /// `CONNECT`, the transport switched to transparent mode.
    Connect,
    Error,
    /// `+CME ERROR: <text>`, verbose or numeric depending on `AT+CMEE`.
    CmeError(String<CME_TEXT_LEN>),
    /// The echo did not match the command that was sent.
    ProtocolFault,
}

impl AtOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AtOutcome::Ok | AtOutcome::Connect)
    }

    /// The terminal marker, without the vendor error text.
    pub fn marker(&self) -> &'static str {
        match self {
            AtOutcome::Ok => "OK",
            AtOutcome::Connect => "CONNECT",
            AtOutcome::Error => "ERROR",
            AtOutcome::CmeError(_) => "+CME ERROR",
            AtOutcome::ProtocolFault => "",
        }
    }
}

impl Display for AtOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AtOutcome::Ok => write!(f, "OK"),
            AtOutcome::Connect => write!(f, "CONNECT"),
            AtOutcome::Error => write!(f, "ERROR"),
            AtOutcome::CmeError(text) => write!(f, "+CME ERROR: {text}"),
            AtOutcome::ProtocolFault => write!(f, "protocol fault"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for AtOutcome {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            AtOutcome::Ok => defmt::write!(fmt, "OK"),
            AtOutcome::Connect => defmt::write!(fmt, "CONNECT"),
            AtOutcome::Error => defmt::write!(fmt, "ERROR"),
            AtOutcome::CmeError(text) => defmt::write!(fmt, "+CME ERROR: {}", text.as_str()),
            AtOutcome::ProtocolFault => defmt::write!(fmt, "protocol fault"),
        }
    }
}

/// Match a complete line against the terminal markers, in priority order.
pub fn classify(line: &str) -> Option<AtOutcome> {
    if line.starts_with("ERROR") {
        Some(AtOutcome::Error)
    } else if let Some(rest) = line.strip_prefix("+CME ERROR") {
        let mut text = String::new();
        for c in rest.trim_start_matches(':').trim().chars() {
            if text.push(c).is_err() {
                break;
            }
        }
        Some(AtOutcome::CmeError(text))
    } else if line.starts_with("CONNECT") {
        Some(AtOutcome::Connect)
    } else if line.starts_with("OK") {
        Some(AtOutcome::Ok)
    } else {
        None
    }
}

/// Receiver of everything the framer extracts from the byte stream.
pub trait FrameSink {
    /// A non-terminal line belonging to the command in flight.
    fn response_line(&mut self, line: &str);
    /// One byte of a raw block belonging to the command in flight.
    fn raw_byte(&mut self, byte: u8);
    /// The command in flight (or the transparent-mode exit) reached a terminal state.
    fn completed(&mut self, outcome: AtOutcome);
    /// A line that was not requested by any command.
    fn unsolicited(&mut self, line: &str);
}

fn is_line_end(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

/// Byte-level state machine of the AT transport.
///
/// It does no I/O: bytes are pushed in one at a time and the results are reported to a
/// [`FrameSink`].
pub struct Framer {
    mode: TransportMode,
    state: ParseState,
    echo: String<AT_COMMAND_SIZE>,
    echo_cursor: usize,
    line: Vec<u8, AT_LINE_SIZE>,
    raw_block: Option<usize>,
    raw_remaining: usize,
    exit_armed: bool,
    /// A URC was still arriving when the command was submitted.
    partial_urc: bool,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub const fn new() -> Self {
        Self {
            mode: TransportMode::Down,
            state: ParseState::Idle,
            echo: String::new(),
            echo_cursor: 0,
            line: Vec::new(),
            raw_block: None,
            raw_remaining: 0,
            exit_armed: false,
            partial_urc: false,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// True from `submit` until the command reaches its terminal classification.
    pub fn command_in_flight(&self) -> bool {
        matches!(
            self.state,
            ParseState::AwaitingEcho | ParseState::AwaitingResponse | ParseState::AwaitingRawBlock
        )
    }

    /// Switches the transport mode and drops any parsing in progress.
    pub fn set_mode(&mut self, mode: TransportMode) {
        self.mode = mode;
        self.reset();
    }

    /// Drops any parsing in progress and returns to `Idle`.
    pub fn reset(&mut self) {
        self.state = ParseState::Idle;
        self.echo.clear();
        self.echo_cursor = 0;
        self.line.clear();
        self.raw_block = None;
        self.raw_remaining = 0;
        self.exit_armed = false;
        self.partial_urc = false;
    }

    /// Starts echo matching for `command`, the full text sent without the trailing `\r`.
    ///
    /// With `raw_block` set, exactly that many bytes following the first response line are
    /// delivered verbatim through [`FrameSink::raw_byte`]. A URC that is still arriving is
    /// completed first, the echo is expected after its line end.
    pub fn submit(&mut self, command: &str, raw_block: Option<usize>) -> crate::Result<()> {
        if self.mode != TransportMode::AtCommand {
            return Err(Error::WrongState);
        }
        match self.state {
            ParseState::Idle | ParseState::AwaitingUnsolicited => {}
            _ => return Err(Error::Busy),
        }
        let partial_urc = self.state == ParseState::AwaitingUnsolicited && !self.line.is_empty();
        let line = core::mem::take(&mut self.line);
        self.reset();
        if partial_urc {
            debug!("Command submitted in the middle of a URC");
            self.line = line;
            self.partial_urc = true;
        }
        self.echo.push_str(command).map_err(|_| Error::BufferTooSmallError)?;
        self.raw_block = raw_block.filter(|len| *len > 0);
        self.state = ParseState::AwaitingEcho;
        Ok(())
    }

    /// Prepares for leaving transparent mode: from now on bytes are framed as URCs and the
    /// first `OK` line completes the exit.
    pub fn arm_exit(&mut self) {
        self.set_mode(TransportMode::AtCommand);
        self.state = ParseState::AwaitingUnsolicited;
        self.exit_armed = true;
    }

    pub fn push(&mut self, byte: u8, sink: &mut impl FrameSink) {
        match self.state {
            ParseState::Idle => {
                if !is_line_end(byte) {
                    self.state = ParseState::AwaitingUnsolicited;
                    self.accumulate(byte, sink);
                }
            }
            ParseState::AwaitingEcho if self.partial_urc => self.finish_partial_urc(byte, sink),
            ParseState::AwaitingEcho => self.match_echo(byte, sink),
            ParseState::AwaitingResponse | ParseState::AwaitingUnsolicited => {
                self.accumulate(byte, sink)
            }
            ParseState::AwaitingRawBlock => {
                sink.raw_byte(byte);
                self.raw_remaining -= 1;
                if self.raw_remaining == 0 {
                    self.state = ParseState::AwaitingResponse;
                }
            }
        }
    }

    fn finish_partial_urc(&mut self, byte: u8, sink: &mut impl FrameSink) {
        match byte {
            b'\n' => {
                let line = core::mem::take(&mut self.line);
                self.partial_urc = false;
                match core::str::from_utf8(&line) {
                    Ok(text) => sink.unsolicited(text),
                    Err(_) => warn!("Dropping line that is not valid UTF-8"),
                }
            }
            b'\r' => {}
            _ => {
                if self.line.push(byte).is_err() {
                    warn!("URC too long, truncating");
                }
            }
        }
    }

    fn match_echo(&mut self, byte: u8, sink: &mut impl FrameSink) {
        let echo = self.echo.as_bytes();
        if self.echo_cursor < echo.len() {
            if echo[self.echo_cursor] == byte {
                self.echo_cursor += 1;
            } else if self.echo_cursor == 0 && is_line_end(byte) {
                // Line ends left over from the previous response.
            } else {
                warn!(
                    "Echo mismatch at position {} of {}",
                    self.echo_cursor,
                    self.echo.as_str()
                );
                self.finish(AtOutcome::ProtocolFault, sink);
            }
        } else if is_line_end(byte) {
            self.state = ParseState::AwaitingResponse;
            self.line.clear();
        } else {
            warn!("Echo of {} continues past its end", self.echo.as_str());
            self.finish(AtOutcome::ProtocolFault, sink);
        }
    }

    fn accumulate(&mut self, byte: u8, sink: &mut impl FrameSink) {
        match byte {
            b'\n' => self.complete_line(sink),
            b'\r' => {}
            _ => {
                if self.line.push(byte).is_err() {
                    self.flush_partial_line(sink);
                    let _ = self.line.push(byte);
                }
            }
        }
    }

    fn complete_line(&mut self, sink: &mut impl FrameSink) {
        let line = core::mem::take(&mut self.line);
        if self.state == ParseState::AwaitingUnsolicited {
            self.state = ParseState::Idle;
        }
        if line.is_empty() {
            return;
        }
        let Ok(text) = core::str::from_utf8(&line) else {
            warn!("Dropping line that is not valid UTF-8");
            return;
        };

        match self.state {
            ParseState::AwaitingResponse => match classify(text) {
                Some(outcome) => {
                    if outcome == AtOutcome::Connect {
                        self.mode = TransportMode::Transparent;
                    }
                    self.finish(outcome, sink);
                }
                None => {
                    sink.response_line(text);
                    if let Some(len) = self.raw_block.take() {
                        self.raw_remaining = len;
                        self.state = ParseState::AwaitingRawBlock;
                    }
                }
            },
            ParseState::Idle => {
                if self.exit_armed && text.starts_with("OK") {
                    self.exit_armed = false;
                    sink.completed(AtOutcome::Ok);
                } else {
                    sink.unsolicited(text);
                }
            }
            _ => {}
        }
    }

    /// The line buffer is full: hand over what we have and keep framing the rest.
    fn flush_partial_line(&mut self, sink: &mut impl FrameSink) {
        let line = core::mem::take(&mut self.line);
        let Ok(text) = core::str::from_utf8(&line) else {
            warn!("Dropping partial line that is not valid UTF-8");
            return;
        };
        match self.state {
            ParseState::AwaitingResponse => sink.response_line(text),
            ParseState::AwaitingUnsolicited => sink.unsolicited(text),
            _ => {}
        }
    }

    fn finish(&mut self, outcome: AtOutcome, sink: &mut impl FrameSink) {
        self.state = ParseState::Idle;
        self.echo_cursor = 0;
        self.line.clear();
        self.raw_block = None;
        self.raw_remaining = 0;
        sink.completed(outcome);
    }
}

#[cfg(test)]
mod test_framer {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        lines: Vec<String<AT_LINE_SIZE>, 8>,
        urcs: Vec<String<AT_LINE_SIZE>, 8>,
        raw: Vec<u8, 32>,
        outcomes: Vec<AtOutcome, 4>,
    }

    impl FrameSink for RecordingSink {
        fn response_line(&mut self, line: &str) {
            self.lines.push(line.try_into().unwrap()).unwrap();
        }

        fn raw_byte(&mut self, byte: u8) {
            self.raw.push(byte).unwrap();
        }

        fn completed(&mut self, outcome: AtOutcome) {
            self.outcomes.push(outcome).unwrap();
        }

        fn unsolicited(&mut self, line: &str) {
            self.urcs.push(line.try_into().unwrap()).unwrap();
        }
    }

    fn feed(framer: &mut Framer, bytes: &[u8], sink: &mut RecordingSink) {
        for byte in bytes {
            framer.push(*byte, sink);
        }
    }

    fn at_framer() -> Framer {
        let mut framer = Framer::new();
        framer.set_mode(TransportMode::AtCommand);
        framer
    }

    #[test]
    fn test_echo_then_response() {
        for command in ["AT", "AT+CSQ", "AT^SISS=1,\"srvType\",\"Socket\""] {
            let mut framer = at_framer();
            let mut sink = RecordingSink::default();
            framer.submit(command, None).unwrap();
            feed(&mut framer, command.as_bytes(), &mut sink);
            assert_eq!(framer.state(), ParseState::AwaitingEcho);
            feed(&mut framer, b"\r", &mut sink);
            assert_eq!(framer.state(), ParseState::AwaitingResponse);
            assert!(sink.outcomes.is_empty());
        }
    }

    #[test]
    fn test_echo_mismatch_is_protocol_fault() {
        let command = "AT+CPIN?";
        for position in 0..command.len() {
            let mut framer = at_framer();
            let mut sink = RecordingSink::default();
            framer.submit(command, None).unwrap();
            feed(&mut framer, &command.as_bytes()[..position], &mut sink);
            framer.push(b'#', &mut sink);
            assert_eq!(sink.outcomes.as_slice(), &[AtOutcome::ProtocolFault]);
            assert_eq!(framer.state(), ParseState::Idle);
        }
    }

    #[test]
    fn test_response_lines_and_ok() {
        let mut framer = at_framer();
        let mut sink = RecordingSink::default();
        framer.submit("AT^SMONI", None).unwrap();
        feed(
            &mut framer,
            b"\r\nAT^SMONI\r\r\n^SMONI: 2G,71,-61,262,02,0143,83BA,33,33,3,6,G,NOCONN\r\n\r\nOK\r\n",
            &mut sink,
        );
        assert_eq!(
            sink.lines.as_slice(),
            &["^SMONI: 2G,71,-61,262,02,0143,83BA,33,33,3,6,G,NOCONN"]
        );
        assert_eq!(sink.outcomes.as_slice(), &[AtOutcome::Ok]);
        assert_eq!(framer.state(), ParseState::Idle);
    }

    #[test]
    fn test_terminal_markers() {
        assert_eq!(classify("OK"), Some(AtOutcome::Ok));
        assert_eq!(classify("ERROR"), Some(AtOutcome::Error));
        assert_eq!(classify("CONNECT 115200"), Some(AtOutcome::Connect));
        assert_eq!(
            classify("+CME ERROR: SIM not inserted"),
            Some(AtOutcome::CmeError("SIM not inserted".try_into().unwrap()))
        );
        assert_eq!(classify("+CSQ: 17,99"), None);
    }

    #[test]
    fn test_connect_switches_to_transparent() {
        let mut framer = at_framer();
        let mut sink = RecordingSink::default();
        framer.submit("AT^SIST=1", None).unwrap();
        feed(&mut framer, b"AT^SIST=1\r\r\nCONNECT\r\n", &mut sink);
        assert_eq!(sink.outcomes.as_slice(), &[AtOutcome::Connect]);
        assert_eq!(framer.mode(), TransportMode::Transparent);
    }

    #[test]
    fn test_urc_when_idle() {
        let mut framer = at_framer();
        let mut sink = RecordingSink::default();
        feed(&mut framer, b"\r\n^SYSSTART\r\n\r\n+PBREADY\r\n", &mut sink);
        assert_eq!(sink.urcs.as_slice(), &["^SYSSTART", "+PBREADY"]);
        assert_eq!(framer.state(), ParseState::Idle);
    }

    #[test]
    fn test_raw_block() {
        let mut framer = at_framer();
        let mut sink = RecordingSink::default();
        framer.submit("AT^SISR=1,5", Some(5)).unwrap();
        feed(
            &mut framer,
            b"AT^SISR=1,5\r\r\n^SISR: 1,5\r\nOK\r\n\r\nOK\r\n",
            &mut sink,
        );
        assert_eq!(sink.lines.as_slice(), &["^SISR: 1,5"]);
        assert_eq!(sink.raw.as_slice(), b"OK\r\n\r");
        // The "\nOK\r\n" left after the block is framed as a normal line.
        assert_eq!(sink.outcomes.as_slice(), &[AtOutcome::Ok]);
    }

    #[test]
    fn test_line_overflow_flushes_partial_line() {
        let mut framer = at_framer();
        let mut sink = RecordingSink::default();
        let long = [b'x'; AT_LINE_SIZE + 10];
        feed(&mut framer, &long, &mut sink);
        feed(&mut framer, b"\r\n", &mut sink);
        assert_eq!(sink.urcs.len(), 2);
        assert_eq!(sink.urcs[0].len(), AT_LINE_SIZE);
        assert_eq!(sink.urcs[1].len(), 10);
    }

    #[test]
    fn test_exit_completes_on_ok() {
        let mut framer = Framer::new();
        framer.set_mode(TransportMode::Transparent);
        framer.arm_exit();
        let mut sink = RecordingSink::default();
        feed(&mut framer, b"\r\n^SISW: 1,2\r\n\r\nOK\r\n", &mut sink);
        assert_eq!(sink.urcs.as_slice(), &["^SISW: 1,2"]);
        assert_eq!(sink.outcomes.as_slice(), &[AtOutcome::Ok]);
        assert_eq!(framer.mode(), TransportMode::AtCommand);
    }

    #[test]
    fn test_urc_in_progress_completes_before_echo() {
        let mut framer = at_framer();
        let mut sink = RecordingSink::default();
        feed(&mut framer, b"\r\n+CIEV: sig", &mut sink);
        assert_eq!(framer.state(), ParseState::AwaitingUnsolicited);

        framer.submit("AT+CSQ", None).unwrap();
        feed(&mut framer, b"nal,3\r\nAT+CSQ\r\r\n+CSQ: 17,99\r\n\r\nOK\r\n", &mut sink);
        assert_eq!(sink.urcs.as_slice(), &["+CIEV: signal,3"]);
        assert_eq!(sink.lines.as_slice(), &["+CSQ: 17,99"]);
        assert_eq!(sink.outcomes.as_slice(), &[AtOutcome::Ok]);
    }

    #[test]
    fn test_submit_rejected_when_busy_or_down() {
        let mut framer = Framer::new();
        assert_eq!(framer.submit("AT", None), Err(Error::WrongState));
        framer.set_mode(TransportMode::AtCommand);
        framer.submit("AT", None).unwrap();
        assert_eq!(framer.submit("AT", None), Err(Error::Busy));
    }
}
