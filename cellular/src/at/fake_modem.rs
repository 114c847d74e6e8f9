extern crate std;

use std::collections::VecDeque;
use std::string::{String, ToString};
use std::sync::{Arc, Mutex, MutexGuard};
use std::vec::Vec;

use crate::at::uart::{IoEvents, ModemUart};
use crate::modem::hw::ModemPower;

/// Byte the fake answers with when the local baud rate does not match its own.
const LINE_NOISE: u8 = 0xff;

struct State {
    rx: VecDeque<u8>,
    line: Vec<u8>,
    script: VecDeque<(String, String)>,
    sent: Vec<String>,
    baud_rate: u32,
    answer_baud_rate: u32,
    transparent: bool,
    payload: Vec<u8>,
    dtr: bool,
    powered: bool,
    power_good: bool,
    boot_urc: bool,
    silent: bool,
}

/// A scripted modem on the other end of the UART.
///
/// It echoes every command, checks it against the script and replies with the scripted lines.
/// Clones share the same state, so a test keeps one handle and gives another to the engine.
#[derive(Clone)]
pub struct FakeModem {
    state: Arc<Mutex<State>>,
    events: &'static IoEvents,
}

impl FakeModem {
    /// A fake answering at `baud_rate`, with the local side configured to the same rate.
    pub fn new(events: &'static IoEvents, baud_rate: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                rx: VecDeque::new(),
                line: Vec::new(),
                script: VecDeque::new(),
                sent: Vec::new(),
                baud_rate,
                answer_baud_rate: baud_rate,
                transparent: false,
                payload: Vec::new(),
                dtr: true,
                powered: false,
                power_good: true,
                boot_urc: true,
                silent: false,
            })),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Expects `command` (with the `AT` prefix) next and answers with `lines`.
    ///
    /// The last line is usually the terminal marker, e.g. `["+CSQ: 17,99", "OK"]`.
    pub fn expect(&self, command: &str, lines: &[&str]) -> &Self {
        let mut response = String::new();
        for line in lines {
            response.push_str("\r\n");
            response.push_str(line);
            response.push_str("\r\n");
        }
        self.expect_raw(command, &response)
    }

    /// Like [`FakeModem::expect`], but the answer is sent verbatim.
    pub fn expect_raw(&self, command: &str, response: &str) -> &Self {
        self.state()
            .script
            .push_back((command.to_string(), response.to_string()));
        self
    }

    /// Makes the modem side talk at a different rate than the local side.
    pub fn set_answer_baud_rate(&self, baud_rate: u32) {
        self.state().answer_baud_rate = baud_rate;
    }

    pub fn answer_baud_rate(&self) -> u32 {
        self.state().answer_baud_rate
    }

    pub fn set_power_good(&self, power_good: bool) {
        self.state().power_good = power_good;
    }

    pub fn set_boot_urc(&self, boot_urc: bool) {
        self.state().boot_urc = boot_urc;
    }

    /// A silent modem swallows commands without echo or answer.
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    pub fn is_powered(&self) -> bool {
        self.state().powered
    }

    /// Bytes arriving from the modem, e.g. a URC or payload from the remote end.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.state().rx.extend(bytes);
        self.events.notify_rx();
    }

    /// The remote end closed the connection: DCD drops.
    pub fn drop_carrier(&self) {
        self.state().transparent = false;
        self.events.notify_carrier_lost();
    }

    pub fn is_transparent(&self) -> bool {
        self.state().transparent
    }

    /// Commands the modem understood, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    /// Payload written while in transparent mode.
    pub fn payload(&self) -> Vec<u8> {
        self.state().payload.clone()
    }

    pub fn all_done(&self) -> bool {
        self.state().script.is_empty()
    }

    fn on_command(state: &mut State, command: String) {
        if state.silent {
            return;
        }
        if state.baud_rate != state.answer_baud_rate {
            state.rx.push_back(LINE_NOISE);
            return;
        }
        state.rx.extend(command.as_bytes());
        state.rx.push_back(b'\r');
        let (expected, response) = state
            .script
            .pop_front()
            .unwrap_or_else(|| panic!("Unexpected command {command}"));
        assert_eq!(expected, command, "Expected {expected}, got {command}");
        state.rx.extend(response.as_bytes());
        if response.contains("\r\nCONNECT") {
            state.transparent = true;
        }
        if let Some(rate) = command.strip_prefix("AT+IPR=")
            && response.contains("\r\nOK\r\n")
        {
            state.answer_baud_rate = rate.parse().unwrap();
        }
        state.sent.push(command);
    }
}

impl ModemUart for FakeModem {
    fn write(&mut self, bytes: &[u8]) -> usize {
        let mut state = self.state();
        if state.transparent {
            state.payload.extend_from_slice(bytes);
            return bytes.len();
        }
        let mut answered = false;
        for byte in bytes {
            if *byte == b'\r' {
                let line = core::mem::take(&mut state.line);
                let command = String::from_utf8(line).unwrap();
                Self::on_command(&mut state, command);
                answered = true;
            } else {
                state.line.push(*byte);
            }
        }
        drop(state);
        if answered {
            self.events.notify_rx();
        }
        self.events.notify_tx_ready();
        bytes.len()
    }

    fn bytes_available(&self) -> usize {
        self.state().rx.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.state().rx.pop_front()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) {
        self.state().baud_rate = baud_rate;
    }

    fn set_dtr(&mut self, active: bool) {
        let mut state = self.state();
        let rising = active && !state.dtr;
        state.dtr = active;
        if rising && state.transparent {
            state.transparent = false;
            state.rx.extend(b"\r\nOK\r\n");
            drop(state);
            self.events.notify_rx();
        }
    }
}

/// Power switch of a [`FakeModem`].
pub struct FakePower {
    modem: FakeModem,
}

impl FakePower {
    pub fn new(modem: FakeModem) -> Self {
        Self { modem }
    }
}

impl ModemPower for FakePower {
    fn set_power(&mut self, on: bool) {
        let mut state = self.modem.state();
        state.powered = on;
        if !on {
            state.transparent = false;
            return;
        }
        let boot = state.boot_urc && state.power_good;
        let in_sync = state.baud_rate == state.answer_baud_rate;
        drop(state);
        if boot && in_sync {
            self.modem.push_rx(b"\r\n^SYSSTART\r\n");
        }
    }

    fn power_good(&mut self) -> bool {
        self.modem.state().power_good
    }
}
