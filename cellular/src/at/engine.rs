use core::cell::RefCell;
use core::convert::Infallible;
use core::future::Future;

#[cfg(feature = "defmt")]
use defmt::{debug, warn};
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::{Channel, TrySendError};
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer, WithTimeout, block_for};
use heapless::{String, Vec, format};
#[cfg(not(feature = "defmt"))]
use log::{debug, warn};

use crate::RawMutex;
use crate::at::callbacks::{CallbackRegistry, Category, Handler, Notification, dispatch_to};
use crate::at::framer::{AtOutcome, FrameSink, Framer, ParseState, TransportMode};
use crate::at::response::{AT_COMMAND_SIZE, AT_LINE_SIZE, AT_LINES, AtResponse, FromModem};
use crate::at::uart::{IoEvents, ModemUart};
use crate::error::Error;

/// Largest raw block a command can request.
pub const RAW_BLOCK_SIZE: usize = 256;
/// URCs kept for [`AtEngine::wait_urc`], the oldest ones are dropped first.
pub const URC_QUEUE_SIZE: usize = 8;
const URC_BATCH: usize = 4;
/// Length of the DTR low pulse that makes the modem leave transparent mode.
const DTR_PULSE: Duration = Duration::from_millis(1);

/// Tunables of the engine.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Minimum silence between the completion of one command and the start of the next one.
    ///
    /// URCs that the modem emits right after a response are delivered inside this window.
    pub quiet_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(100),
        }
    }
}

struct PendingCommand {
    /// Lines not yet handed to the caller. The consumer pauses while this is full.
    lines: Vec<FromModem, AT_LINES>,
    raw: Vec<u8, RAW_BLOCK_SIZE>,
}

impl PendingCommand {
    fn new() -> Self {
        Self {
            lines: Vec::new(),
            raw: Vec::new(),
        }
    }
}

struct Inner<U: ModemUart> {
    uart: U,
    framer: Framer,
    pending: Option<PendingCommand>,
    quiet_until: Instant,
    transparent_seen: usize,
    reader_active: bool,
}

/// Everything one pass of the consumer extracted from the receive buffer, published after the
/// engine state is released.
#[derive(Default)]
struct Step {
    outcome: Option<AtOutcome>,
    urcs: Vec<String<AT_LINE_SIZE>, URC_BATCH>,
    carrier_lost: bool,
    lines_ready: bool,
    data_arrived: Option<usize>,
    wake_readers: bool,
    more: bool,
}

struct EngineSink<'a> {
    pending: &'a mut Option<PendingCommand>,
    outcome: &'a mut Option<AtOutcome>,
    urcs: &'a mut Vec<String<AT_LINE_SIZE>, URC_BATCH>,
}

impl EngineSink<'_> {
    fn lines_full(&self) -> bool {
        self.pending.as_ref().is_some_and(|pending| pending.lines.is_full())
    }
}

impl FrameSink for EngineSink<'_> {
    fn response_line(&mut self, line: &str) {
        let Some(pending) = self.pending.as_mut() else {
            warn!("Response line without a command: {}", line);
            return;
        };
        let pushed = FromModem::new(line)
            .and_then(|line| pending.lines.push(line).map_err(|_| Error::BufferTooSmallError));
        if let Err(err) = pushed {
            warn!("Dropping response line {}: {}", line, err);
        }
    }

    fn raw_byte(&mut self, byte: u8) {
        if let Some(pending) = self.pending.as_mut()
            && pending.raw.push(byte).is_err()
        {
            warn!("Raw block overflow");
        }
    }

    fn completed(&mut self, outcome: AtOutcome) {
        *self.outcome = Some(outcome);
    }

    fn unsolicited(&mut self, line: &str) {
        match String::try_from(line) {
            Ok(line) => {
                if self.urcs.push(line).is_err() {
                    warn!("URC batch full, dropping URC");
                }
            }
            Err(_) => warn!("URC too long: {}", line),
        }
    }
}

/// Hands `lines` to the classifier and keeps as many as fit for typed parsing.
fn deliver_lines(
    lines: Vec<FromModem, AT_LINES>,
    classifier: &mut Option<&mut dyn FnMut(&FromModem)>,
    kept: &mut Vec<FromModem, AT_LINES>,
) {
    for line in lines {
        if let Some(classifier) = classifier {
            classifier(&line);
        }
        if let Err(line) = kept.push(line) {
            debug!("Response line not kept: {}", line.as_str());
        }
    }
}

/// The AT transport engine and its command/response facade.
///
/// [`AtEngine::run`] is the consumer side: it must be polled concurrently with every other
/// method. It drains the UART whenever [`IoEvents`] fires and owns all framing state. Callers
/// issue commands with [`AtEngine::send`] and exchange payload with [`AtEngine::read`] and
/// [`AtEngine::write`] once the transport is transparent.
pub struct AtEngine<U: ModemUart> {
    inner: BlockingMutex<RawMutex, RefCell<Inner<U>>>,
    registry: BlockingMutex<RawMutex, RefCell<CallbackRegistry>>,
    events: &'static IoEvents,
    command_lock: Mutex<RawMutex, ()>,
    done: Signal<RawMutex, AtOutcome>,
    lines_ready: Signal<RawMutex, ()>,
    rx_ready: Signal<RawMutex, ()>,
    tx_ready: Signal<RawMutex, ()>,
    urcs: Channel<RawMutex, String<AT_LINE_SIZE>, URC_QUEUE_SIZE>,
    config: EngineConfig,
}

impl<U: ModemUart> AtEngine<U> {
    pub fn new(uart: U, events: &'static IoEvents, config: EngineConfig) -> Self {
        Self {
            inner: BlockingMutex::new(RefCell::new(Inner {
                uart,
                framer: Framer::new(),
                pending: None,
                quiet_until: Instant::from_ticks(0),
                transparent_seen: 0,
                reader_active: false,
            })),
            registry: BlockingMutex::new(RefCell::new(CallbackRegistry::new())),
            events,
            command_lock: Mutex::new(()),
            done: Signal::new(),
            lines_ready: Signal::new(),
            rx_ready: Signal::new(),
            tx_ready: Signal::new(),
            urcs: Channel::new(),
            config,
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<U>) -> R) -> R {
        self.inner.lock(|inner| f(&mut inner.borrow_mut()))
    }

    pub fn mode(&self) -> TransportMode {
        self.with_inner(|inner| inner.framer.mode())
    }

    pub fn parse_state(&self) -> ParseState {
        self.with_inner(|inner| inner.framer.state())
    }

    pub fn is_transparent(&self) -> bool {
        self.mode() == TransportMode::Transparent
    }

    /// The modem has been powered, start framing AT traffic.
    pub fn power_up(&self) {
        self.with_inner(|inner| inner.framer.set_mode(TransportMode::AtCommand));
    }

    /// The modem has been powered off, discard everything it may still send.
    pub fn power_down(&self) {
        self.with_inner(|inner| {
            inner.framer.set_mode(TransportMode::Down);
            inner.pending = None;
        });
        self.rx_ready.signal(());
        self.tx_ready.signal(());
    }

    /// Changes the local baud rate. A partially received line is dropped.
    pub fn set_baud_rate(&self, baud_rate: u32) {
        self.with_inner(|inner| {
            inner.uart.set_baud_rate(baud_rate);
            if inner.framer.state() != ParseState::Idle {
                inner.framer.reset();
            }
        });
    }

    pub fn subscribe(&self, category: Category, handler: Handler) -> crate::Result<()> {
        self.registry.lock(|registry| registry.borrow_mut().subscribe(category, handler))
    }

    pub fn unsubscribe(&self, category: Category, handler: Handler) {
        self.registry.lock(|registry| registry.borrow_mut().unsubscribe(category, handler))
    }

    fn dispatch(&self, notification: Notification<'_>) {
        let handlers =
            self.registry.lock(|registry| registry.borrow().handlers(notification.category()));
        let result = dispatch_to(&handlers, &notification);
        if result != 0 {
            debug!("Subscriber of {:?} returned {}", notification.category(), result);
        }
    }

    /// Consumer loop. Never returns, poll it next to the code that uses the engine.
    pub async fn run(&self) -> Infallible {
        loop {
            let flags = self.events.wait().await;
            if flags.tx() {
                self.tx_ready.signal(());
            }
            let mut carrier_lost = flags.carrier_lost();
            loop {
                let step = self.step(carrier_lost);
                carrier_lost = false;
                let more = step.more;
                self.publish(step);
                if !more {
                    break;
                }
            }
        }
    }

    /// Runs `fut` while the consumer loop is being polled.
    pub async fn run_while<T>(&self, fut: impl Future<Output = T>) -> T {
        match select(self.run(), fut).await {
            Either::First(never) => match never {},
            Either::Second(result) => result,
        }
    }

    fn step(&self, carrier_lost: bool) -> Step {
        let mut step = Step::default();
        self.with_inner(|inner| {
            if carrier_lost {
                if inner.framer.mode() == TransportMode::Transparent {
                    inner.framer.set_mode(TransportMode::AtCommand);
                    step.carrier_lost = true;
                    step.wake_readers = true;
                } else {
                    debug!("Carrier lost outside of transparent mode");
                }
            }

            match inner.framer.mode() {
                TransportMode::Down => while inner.uart.read_byte().is_some() {},
                TransportMode::Transparent => {}
                TransportMode::AtCommand => {
                    let mut sink = EngineSink {
                        pending: &mut inner.pending,
                        outcome: &mut step.outcome,
                        urcs: &mut step.urcs,
                    };
                    while sink.urcs.len() < URC_BATCH
                        && sink.outcome.is_none()
                        && !(sink.lines_full() && inner.framer.command_in_flight())
                        && inner.framer.mode() == TransportMode::AtCommand
                    {
                        let Some(byte) = inner.uart.read_byte() else {
                            break;
                        };
                        inner.framer.push(byte, &mut sink);
                    }
                    if inner.framer.mode() == TransportMode::Transparent {
                        // CONNECT: whatever follows is payload.
                        inner.transparent_seen = 0;
                    }
                    let pending_lines = inner.pending.as_ref().map_or(0, |pending| pending.lines.len());
                    step.lines_ready = pending_lines > 0;
                    // With the line buffer full the consumer waits for the caller to drain it.
                    let paused = pending_lines == AT_LINES && inner.framer.command_in_flight();
                    step.more = inner.framer.mode() == TransportMode::AtCommand
                        && !paused
                        && inner.uart.bytes_available() > 0;
                }
            }

            if inner.framer.mode() == TransportMode::Transparent {
                let available = inner.uart.bytes_available();
                if available > inner.transparent_seen && !inner.reader_active {
                    step.data_arrived = Some(available);
                }
                inner.transparent_seen = available;
                step.wake_readers = true;
            }
        });
        step
    }

    fn publish(&self, step: Step) {
        if step.wake_readers {
            self.rx_ready.signal(());
        }
        if step.carrier_lost {
            warn!("Carrier lost, back to command mode");
            self.tx_ready.signal(());
            self.dispatch(Notification::CarrierLost);
        }
        for urc in &step.urcs {
            debug!("URC: {}", urc.as_str());
            if let Err(TrySendError::Full(urc)) = self.urcs.try_send(urc.clone()) {
                if let Ok(oldest) = self.urcs.try_receive() {
                    debug!("URC queue full, dropping {}", oldest.as_str());
                }
                let _ = self.urcs.try_send(urc);
            }
            self.dispatch(Notification::Unsolicited(urc.as_str()));
        }
        if step.lines_ready {
            self.lines_ready.signal(());
        }
        if let Some(outcome) = step.outcome {
            self.dispatch(Notification::Response(outcome.marker()));
            self.done.signal(outcome);
        }
        if let Some(available) = step.data_arrived {
            self.dispatch(Notification::DataArrived(available));
        }
    }

    /// Sends `command` (without the `AT` prefix) and waits up to `timeout` for its terminal
    /// classification.
    ///
    /// `None` leaves transparent mode instead. Each non-terminal response line is handed to
    /// `classifier` exactly once, as soon as it is complete, even if the command later times out.
    /// Only the first few lines are kept in the returned [`AtResponse`]. Classified `ERROR`s are returned as a response, only
    /// transport faults (busy, wrong mode, timeout) are errors.
    pub async fn send(
        &self,
        command: Option<&str>,
        timeout: Duration,
        classifier: Option<&mut dyn FnMut(&FromModem)>,
    ) -> crate::Result<AtResponse> {
        let _guard = self.command_lock.try_lock().map_err(|_| Error::Busy)?;
        match (self.mode(), command) {
            (TransportMode::Down, _)
            | (TransportMode::Transparent, Some(_))
            | (TransportMode::AtCommand, None) => return Err(Error::WrongState),
            _ => {}
        }
        self.wait_quiet_period().await;

        let start = Instant::now();
        let result = match command {
            Some(command) => self
                .transact(command, None, timeout, classifier)
                .await
                .map(|(response, _)| response),
            None => self.exit_transparent(timeout).await,
        };
        self.rearm_quiet_period();

        let response = result.inspect_err(|err| {
            warn!("{}: {}", command.unwrap_or("<exit transparent>"), err);
        })?;
        debug!(
            "{}: {}, took {}ms",
            command.unwrap_or("<exit transparent>"),
            response,
            (Instant::now() - start).as_millis()
        );
        Ok(response)
    }

    /// Sends `command` and requires `OK` or `CONNECT`.
    pub async fn call_at(&self, command: &str, timeout: Duration) -> crate::Result<AtResponse> {
        let response = self.send(Some(command), timeout, None).await?;
        if response.outcome().is_success() {
            Ok(response)
        } else {
            Err(Error::AtErrorResponse)
        }
    }

    /// Sends `command` whose first response line is followed by exactly `buf.len()` raw bytes.
    ///
    /// Returns the response and the number of raw bytes copied into `buf`.
    pub async fn read_block(
        &self,
        command: &str,
        buf: &mut [u8],
        timeout: Duration,
    ) -> crate::Result<(AtResponse, usize)> {
        if buf.len() > RAW_BLOCK_SIZE {
            return Err(Error::BufferTooSmallError);
        }
        let _guard = self.command_lock.try_lock().map_err(|_| Error::Busy)?;
        self.wait_quiet_period().await;
        let result = self.transact(command, Some(buf.len()), timeout, None).await;
        self.rearm_quiet_period();

        let (response, raw) = result?;
        buf[..raw.len()].copy_from_slice(&raw);
        Ok((response, raw.len()))
    }

    async fn wait_quiet_period(&self) {
        let quiet_until = self.with_inner(|inner| inner.quiet_until);
        Timer::at(quiet_until).await;
    }

    fn rearm_quiet_period(&self) {
        let quiet_until = Instant::now() + self.config.quiet_period;
        self.with_inner(|inner| inner.quiet_until = quiet_until);
    }

    async fn transact(
        &self,
        command: &str,
        raw_block: Option<usize>,
        timeout: Duration,
        mut classifier: Option<&mut dyn FnMut(&FromModem)>,
    ) -> crate::Result<(AtResponse, Vec<u8, RAW_BLOCK_SIZE>)> {
        let text = format!(AT_COMMAND_SIZE; "AT{command}")?;
        let deadline = Instant::now() + timeout;
        self.done.reset();
        self.lines_ready.reset();
        self.with_inner(|inner| {
            inner.framer.submit(&text, raw_block)?;
            inner.pending = Some(PendingCommand::new());
            Ok::<(), Error>(())
        })?;

        let transmitted = match self.write_in_mode(text.as_bytes(), TransportMode::AtCommand, deadline).await {
            Ok(_) => self.write_in_mode(b"\r", TransportMode::AtCommand, deadline).await,
            Err(err) => Err(err),
        };
        if let Err(err) = transmitted {
            self.abort_command();
            return Err(err);
        }

        let mut kept = Vec::new();
        let result = loop {
            let woken = select(self.done.wait(), self.lines_ready.wait())
                .with_deadline(deadline)
                .await;
            deliver_lines(self.take_lines(), &mut classifier, &mut kept);
            match woken {
                Ok(Either::First(outcome)) => break Ok(outcome),
                // Room in the line buffer again, let the consumer continue.
                Ok(Either::Second(())) => self.events.notify_rx(),
                Err(_) => break Err(Error::TimeoutError),
            }
        };

        match result {
            Ok(outcome) => {
                let raw = self
                    .with_inner(|inner| inner.pending.take())
                    .map(|pending| pending.raw)
                    .unwrap_or_default();
                Ok((AtResponse::new(kept, outcome, command), raw))
            }
            Err(err) => {
                self.abort_command();
                Err(err)
            }
        }
    }

    fn take_lines(&self) -> Vec<FromModem, AT_LINES> {
        self.with_inner(|inner| {
            inner
                .pending
                .as_mut()
                .map(|pending| core::mem::take(&mut pending.lines))
                .unwrap_or_default()
        })
    }

    fn abort_command(&self) {
        self.with_inner(|inner| {
            inner.pending = None;
            if inner.framer.mode() == TransportMode::AtCommand {
                inner.framer.reset();
            }
        });
    }

    /// Toggles DTR and waits for the `OK` that confirms command mode.
    async fn exit_transparent(&self, timeout: Duration) -> crate::Result<AtResponse> {
        self.done.reset();
        self.with_inner(|inner| {
            if inner.framer.mode() != TransportMode::Transparent {
                return Err(Error::WrongState);
            }
            inner.framer.arm_exit();
            inner.uart.set_dtr(false);
            Ok(())
        })?;
        self.rx_ready.signal(());
        block_for(DTR_PULSE);
        self.with_inner(|inner| inner.uart.set_dtr(true));

        match self.done.wait().with_timeout(timeout).await {
            Ok(outcome) => Ok(AtResponse::new(Vec::new(), outcome, "")),
            Err(_) => {
                self.abort_command();
                Err(Error::TimeoutError)
            }
        }
    }

    /// Writes all of `data` while the transport stays in `mode`.
    ///
    /// Returns early with a short count if the mode changes after the first byte was written.
    async fn write_in_mode(
        &self,
        data: &[u8],
        mode: TransportMode,
        deadline: Instant,
    ) -> crate::Result<usize> {
        let mut written = 0;
        loop {
            self.tx_ready.reset();
            let accepted = self.with_inner(|inner| {
                (inner.framer.mode() == mode).then(|| inner.uart.write(&data[written..]))
            });
            match accepted {
                None if written == 0 => return Err(Error::WrongState),
                None => {
                    warn!("Write aborted after {} of {} bytes", written, data.len());
                    return Ok(written);
                }
                Some(count) => written += count,
            }
            if written == data.len() {
                return Ok(written);
            }
            if self.tx_ready.wait().with_deadline(deadline).await.is_err() {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(Error::TimeoutError)
                };
            }
        }
    }

    /// Reads transparent payload into `buf`.
    ///
    /// Returns once `buf` is full. On carrier loss it returns the bytes copied so far, on
    /// timeout too unless nothing arrived at all.
    pub async fn read(&self, buf: &mut [u8], timeout: Duration) -> crate::Result<usize> {
        let deadline = Instant::now() + timeout;
        self.with_inner(|inner| {
            if inner.framer.mode() != TransportMode::Transparent {
                return Err(Error::WrongState);
            }
            inner.reader_active = true;
            Ok(())
        })?;

        let mut copied = 0;
        let result = loop {
            self.rx_ready.reset();
            let open = self.with_inner(|inner| {
                if inner.framer.mode() != TransportMode::Transparent {
                    return false;
                }
                while copied < buf.len() {
                    match inner.uart.read_byte() {
                        Some(byte) => {
                            buf[copied] = byte;
                            copied += 1;
                        }
                        None => break,
                    }
                }
                inner.transparent_seen = inner.uart.bytes_available();
                true
            });
            if !open {
                debug!("Read released after {} of {} bytes", copied, buf.len());
                break Ok(copied);
            }
            if copied == buf.len() {
                break Ok(copied);
            }
            if self.rx_ready.wait().with_deadline(deadline).await.is_err() {
                break if copied > 0 {
                    Ok(copied)
                } else {
                    Err(Error::TimeoutError)
                };
            }
        };
        self.with_inner(|inner| inner.reader_active = false);
        result
    }

    /// Writes transparent payload, returns the number of bytes accepted by the UART.
    pub async fn write(&self, data: &[u8], timeout: Duration) -> crate::Result<usize> {
        let deadline = Instant::now() + timeout;
        self.write_in_mode(data, TransportMode::Transparent, deadline).await
    }

    /// Waits for a URC for which `matcher` returns true. Other URCs are discarded.
    pub async fn wait_urc(
        &self,
        matcher: impl Fn(&str) -> bool,
        timeout: Duration,
    ) -> crate::Result<String<AT_LINE_SIZE>> {
        let deadline = Instant::now() + timeout;
        loop {
            let urc = self
                .urcs
                .receive()
                .with_deadline(deadline)
                .await
                .map_err(|_| Error::TimeoutError)?;
            if matcher(&urc) {
                return Ok(urc);
            }
            debug!("Skipping URC {}", urc.as_str());
        }
    }

    /// Forgets all URCs queued for [`AtEngine::wait_urc`].
    pub fn clear_urcs(&self) {
        while self.urcs.try_receive().is_ok() {}
    }

    /// Runs `f` with exclusive access to the UART, e.g. to inspect a fake in tests.
    pub fn with_uart<R>(&self, f: impl FnOnce(&mut U) -> R) -> R {
        self.with_inner(|inner| f(&mut inner.uart))
    }
}
