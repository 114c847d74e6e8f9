#[cfg(feature = "defmt")]
use defmt::{debug, error, info, warn};
use embassy_time::{Instant, Timer};
use heapless::format;
#[cfg(not(feature = "defmt"))]
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::at::engine::AtEngine;
use crate::at::framer::AtOutcome;
use crate::at::response::{AT_COMMAND_SIZE, AtResponse, CommandResponse};
use crate::at::uart::ModemUart;
use crate::error::Error;
use crate::modem::{baud, budget};
use crate::modem::config::{ModemConfig, Timeouts, rat_selection};
use crate::modem::hw::ModemPower;
use crate::modem::metrics::{ConnectionMetrics, MetricsRecorder, Milestone, SocketCounters};
use crate::modem::quality::{MAX_QUALITY, ServingCell, parse_csq};

/// Why a connect attempt failed, tagged by the phase that failed.
#[derive(Debug, Error, Eq, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OrchestratorError {
    #[error("Modem not powered: {0}")]
    NotPowered(Error),
    #[error("Device configuration failed: {0}")]
    DeviceConfigFailed(Error),
    #[error("Provider configuration failed: {0}")]
    ProviderConfigFailed(Error),
    #[error("Service configuration failed: {0}")]
    ServiceConfigFailed(Error),
    #[error("Signal query failed: {0}")]
    SignalQueryFailed(Error),
    #[error("Signal quality {measured} below minimum {minimum}")]
    SignalTooLow { measured: u8, minimum: u8 },
    #[error("Connect failed: {0}")]
    ConnectFailed(Error),
    #[error("Cannot enter transparent mode: {0}")]
    EnterTransparentFailed(Error),
    #[error("Publish failed: {0}")]
    PublishFailed(Error),
}

/// Brings the modem from power-off to a transparent TCP session and back.
pub struct Orchestrator<P: ModemPower> {
    config: ModemConfig,
    timeouts: Timeouts,
    power: P,
    recorder: MetricsRecorder,
    failed_attempts: u32,
}

impl<P: ModemPower> Orchestrator<P> {
    pub fn new(config: ModemConfig, power: P) -> Self {
        Self {
            config,
            timeouts: Timeouts::default(),
            power,
            recorder: MetricsRecorder::default(),
            failed_attempts: 0,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    /// Updates the configuration used by the next connect.
    pub fn update_config(&mut self, config: ModemConfig) {
        self.config = config;
    }

    /// Metrics of the last connect and teardown. Only valid if they completed.
    pub fn metrics(&self) -> &ConnectionMetrics {
        self.recorder.metrics()
    }

    /// Consecutive failed attempts, reset by a successful connect. Used for backoff.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Runs the whole connect sequence. On success the engine is in transparent mode.
    pub async fn connect<U: ModemUart>(
        &mut self,
        engine: &AtEngine<U>,
    ) -> Result<(), OrchestratorError> {
        self.recorder.start();
        let deadline = Instant::now() + self.config.connect_budget();
        let result = self.connect_phases(engine, deadline).await;
        match result {
            Ok(()) => {
                self.failed_attempts = 0;
                info!(
                    "Connected in {}ms",
                    self.metrics()
                        .timestamp(Milestone::Connected)
                        .map_or(0, |time| time.as_millis())
                );
            }
            Err(err) => {
                self.failed_attempts += 1;
                self.recorder.invalidate();
                error!("{}, {} failed attempts", err, self.failed_attempts);
            }
        }
        result
    }

    /// A publish over an established session failed. Counts as a failed attempt.
    pub fn record_publish_failure(&mut self, err: Error) -> OrchestratorError {
        self.failed_attempts += 1;
        self.recorder.invalidate();
        error!("Publish failed: {}, {} failed attempts", err, self.failed_attempts);
        OrchestratorError::PublishFailed(err)
    }

    async fn connect_phases<U: ModemUart>(
        &mut self,
        engine: &AtEngine<U>,
        deadline: Instant,
    ) -> Result<(), OrchestratorError> {
        self.power_up(engine, deadline)
            .await
            .map_err(OrchestratorError::NotPowered)?;
        self.recorder.mark(Milestone::TransportReady);

        self.configure_device(engine, deadline)
            .await
            .map_err(OrchestratorError::DeviceConfigFailed)?;
        self.recorder.mark(Milestone::DeviceConfigured);

        self.configure_provider(engine, deadline)
            .await
            .map_err(OrchestratorError::ProviderConfigFailed)?;
        self.recorder.mark(Milestone::ProviderConfigured);

        self.configure_service(engine, deadline)
            .await
            .map_err(OrchestratorError::ServiceConfigFailed)?;
        self.recorder.mark(Milestone::ServiceConfigured);

        self.assess_signal(engine, deadline).await?;

        self.open_session_with_retry(engine, deadline)
            .await
            .map_err(OrchestratorError::ConnectFailed)?;
        self.recorder.mark(Milestone::Connected);

        self.enter_transparent(engine, deadline)
            .await
            .map_err(OrchestratorError::EnterTransparentFailed)
    }

    async fn call<U: ModemUart>(
        &self,
        engine: &AtEngine<U>,
        command: &str,
        deadline: Instant,
    ) -> crate::Result<AtResponse> {
        engine.call_at(command, budget(deadline, self.timeouts.command)).await
    }

    async fn power_up<U: ModemUart>(
        &mut self,
        engine: &AtEngine<U>,
        deadline: Instant,
    ) -> crate::Result<()> {
        engine.clear_urcs();
        engine.set_baud_rate(self.config.baud_rate);
        engine.power_up();
        self.power.set_power(true);
        if !self.power.power_good() {
            error!("Power-good not asserted after power-on");
            self.power.set_power(false);
            engine.power_down();
            return Err(Error::ModemError);
        }
        self.recorder.mark(Milestone::PowerOn);

        let ready = engine
            .wait_urc(
                |urc| urc.starts_with("^SYSSTART"),
                budget(deadline, self.timeouts.ready),
            )
            .await;
        if ready.is_err() {
            warn!("No ^SYSSTART, searching for the baud rate");
            let baud_rate = baud::discover(
                engine,
                self.config.baud_rate,
                self.timeouts.probe,
                self.timeouts.command,
                deadline,
            )
            .await?;
            debug!("Link running at {} baud", baud_rate);
        }
        Ok(())
    }

    async fn configure_device<U: ModemUart>(
        &self,
        engine: &AtEngine<U>,
        deadline: Instant,
    ) -> crate::Result<()> {
        self.call(engine, "+CMEE=2", deadline).await?;
        self.call(engine, "&D1", deadline).await?;
        self.call(engine, "&C1", deadline).await?;
        let rat = rat_selection(self.config.rat, self.config.hardware);
        let command = format!(AT_COMMAND_SIZE; "^SXRAT={}", rat)?;
        self.call(engine, &command, deadline).await?;

        let sim_state = self
            .call(engine, "+CPIN?", deadline)
            .await?
            .parse1::<heapless::String<16>>([0], None)?;
        if sim_state.as_str() == "SIM PIN" {
            match self.config.valid_pin() {
                Some(pin) => {
                    let command = format!(AT_COMMAND_SIZE; "+CPIN={}", pin)?;
                    self.call(engine, &command, deadline).await?;
                }
                None => warn!("SIM asks for a PIN, but the configured one is not 4 digits"),
            }
        } else if sim_state.as_str() != "READY" {
            warn!("Unexpected SIM state {}", sim_state.as_str());
        }

        engine
            .wait_urc(
                |urc| urc.starts_with("+PBREADY"),
                budget(deadline, self.timeouts.phonebook),
            )
            .await?;
        Ok(())
    }

    async fn configure_provider<U: ModemUart>(
        &self,
        engine: &AtEngine<U>,
        deadline: Instant,
    ) -> crate::Result<()> {
        let con = self.config.provider_profile;
        let command = format!(AT_COMMAND_SIZE; "^SICS={},\"conType\",\"GPRS0\"", con)?;
        self.call(engine, &command, deadline).await?;
        let command = format!(AT_COMMAND_SIZE; "^SICS={},\"apn\",\"{}\"", con, self.config.apn)?;
        self.call(engine, &command, deadline).await?;
        Ok(())
    }

    async fn configure_service<U: ModemUart>(
        &self,
        engine: &AtEngine<U>,
        deadline: Instant,
    ) -> crate::Result<()> {
        let srv = self.config.service_profile;
        let command = format!(AT_COMMAND_SIZE; "^SISS={},\"srvType\",\"Socket\"", srv)?;
        self.call(engine, &command, deadline).await?;
        let command = format!(
            AT_COMMAND_SIZE; "^SISS={},\"conId\",\"{}\"", srv, self.config.provider_profile
        )?;
        self.call(engine, &command, deadline).await?;
        let address = self.config.service_address()?;
        let command = format!(AT_COMMAND_SIZE; "^SISS={},\"address\",\"{}\"", srv, address)?;
        self.call(engine, &command, deadline).await?;
        Ok(())
    }

    /// Polls the serving cell until it yields a quality, then gates on the configured minimum.
    async fn assess_signal<U: ModemUart>(
        &mut self,
        engine: &AtEngine<U>,
        deadline: Instant,
    ) -> Result<(), OrchestratorError> {
        let phase_deadline = Instant::now() + budget(deadline, self.timeouts.signal);
        let cell = loop {
            match self.call(engine, "^SMONI", phase_deadline).await {
                Ok(response) => {
                    let cell = response
                        .lines()
                        .iter()
                        .find(|line| line.as_str().starts_with("^SMONI"))
                        .map(|line| ServingCell::parse(line.as_str()));
                    match cell {
                        Some(cell) if cell.quality.is_some() => break cell,
                        Some(cell) => debug!("Serving cell not usable yet: {:?}", cell.state),
                        None => warn!("^SMONI without a serving cell line"),
                    }
                }
                Err(err) => warn!("^SMONI failed: {}", err),
            }
            if Instant::now() + self.timeouts.signal_poll >= phase_deadline {
                error!("No signal quality after {}ms", self.timeouts.signal.as_millis());
                return Err(OrchestratorError::SignalQueryFailed(Error::NoSignalData));
            }
            Timer::after(self.timeouts.signal_poll).await;
        };
        let quality = cell.quality().map_err(OrchestratorError::SignalQueryFailed)?;

        let csq = match self.call(engine, "+CSQ", deadline).await {
            Ok(response) => response
                .lines()
                .iter()
                .find_map(|line| parse_csq(line.as_str()).ok())
                .flatten(),
            Err(err) => {
                warn!("+CSQ failed: {}", err);
                None
            }
        };

        let metrics = self.recorder.metrics_mut();
        metrics.technology = cell.technology;
        metrics.signal.quality = Some(quality);
        metrics.signal.csq = csq;
        self.recorder.mark(Milestone::SignalAssessed);

        let minimum = self.config.min_quality.min(MAX_QUALITY);
        if quality < minimum {
            error!(
                "Signal quality {} ({:?}, CSQ {:?}) below minimum {}",
                quality, cell.technology, csq, minimum
            );
            return Err(OrchestratorError::SignalTooLow {
                measured: quality,
                minimum,
            });
        }
        info!("Signal quality {} on {:?}", quality, cell.technology);
        Ok(())
    }

    async fn open_session_with_retry<U: ModemUart>(
        &self,
        engine: &AtEngine<U>,
        deadline: Instant,
    ) -> crate::Result<()> {
        let srv = self.config.service_profile;
        let close = format!(AT_COMMAND_SIZE; "^SISC={}", srv)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.open_session(engine, deadline).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("Opening service profile {} failed: {}", srv, err);
                    if let Err(err) = self.call(engine, &close, deadline).await {
                        warn!("Closing service profile {} failed: {}", srv, err);
                    }
                    if attempt == 2 {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Opens the socket and waits for `^SISW: <srv>,1`.
    async fn open_session<U: ModemUart>(
        &self,
        engine: &AtEngine<U>,
        deadline: Instant,
    ) -> crate::Result<()> {
        let srv = self.config.service_profile;
        let command = format!(AT_COMMAND_SIZE; "^SISO={}", srv)?;
        engine.clear_urcs();
        self.call(engine, &command, deadline).await?;
        let urc = engine
            .wait_urc(
                |urc| urc.starts_with("^SIS"),
                budget(deadline, self.timeouts.session),
            )
            .await?;
        let response = CommandResponse::new(&urc)?;
        let values = response.parse_values::<u16>().unwrap_or_default();
        if response.command() == "SISW" && values.as_slice() == [u16::from(srv), 1] {
            Ok(())
        } else {
            warn!("Unexpected {} while opening the socket", urc.as_str());
            Err(Error::ModemError)
        }
    }

    async fn enter_transparent<U: ModemUart>(
        &self,
        engine: &AtEngine<U>,
        deadline: Instant,
    ) -> crate::Result<()> {
        let command = format!(AT_COMMAND_SIZE; "^SIST={}", self.config.service_profile)?;
        let response = engine
            .send(Some(&command), budget(deadline, self.timeouts.command), None)
            .await?;
        match response.outcome() {
            AtOutcome::Connect => Ok(()),
            outcome => {
                warn!("{} answered with {}", command.as_str(), outcome);
                Err(Error::AtErrorResponse)
            }
        }
    }

    /// Closes the session of `service_profile`, deregisters and powers the modem off.
    ///
    /// Failures along the way are logged, the modem is powered off regardless.
    pub async fn terminate<U: ModemUart>(&mut self, engine: &AtEngine<U>, service_profile: u8) {
        let deadline = Instant::now() + self.config.terminate_budget();
        if engine.is_transparent()
            && let Err(err) = engine
                .send(None, budget(deadline, self.timeouts.exit_transparent), None)
                .await
        {
            warn!("Leaving transparent mode failed: {}", err);
        }

        match self.socket_counters(engine, service_profile, deadline).await {
            Ok(counters) => {
                info!(
                    "Socket {}: received {}, sent {}, unacknowledged {}",
                    service_profile, counters.received, counters.sent, counters.unacknowledged
                );
                self.recorder.metrics_mut().counters = counters;
            }
            Err(err) => {
                warn!("Cannot read socket counters: {}", err);
                self.recorder.invalidate();
            }
        }

        match self.close_session(engine, service_profile, deadline).await {
            Ok(()) => self.recorder.mark(Milestone::Disconnected),
            Err(err) => {
                warn!("Closing service profile {} failed: {}", service_profile, err);
                self.recorder.invalidate();
            }
        }

        match self.call(engine, "+COPS=2", deadline).await {
            Ok(_) => self.recorder.mark(Milestone::Deregistered),
            Err(err) => {
                warn!("Deregistration failed: {}", err);
                self.recorder.invalidate();
            }
        }

        self.shutdown(engine, deadline).await;
        self.power.set_power(false);
        engine.power_down();
        self.recorder.mark(Milestone::PoweredOff);
    }

    async fn socket_counters<U: ModemUart>(
        &self,
        engine: &AtEngine<U>,
        service_profile: u8,
        deadline: Instant,
    ) -> crate::Result<SocketCounters> {
        let command = format!(AT_COMMAND_SIZE; "^SISI={}", service_profile)?;
        let (_, received, sent, acknowledged, unacknowledged) = self
            .call(engine, &command, deadline)
            .await?
            .parse5::<u8, u32, u32, u32, u32>([0, 2, 3, 4, 5], Some(service_profile))?;
        Ok(SocketCounters {
            received,
            sent,
            acknowledged,
            unacknowledged,
        })
    }

    async fn close_session<U: ModemUart>(
        &self,
        engine: &AtEngine<U>,
        service_profile: u8,
        deadline: Instant,
    ) -> crate::Result<()> {
        let command = format!(AT_COMMAND_SIZE; "^SISC={}", service_profile)?;
        self.call(engine, &command, deadline).await?;
        Ok(())
    }

    /// Asks the modem to shut down cleanly, the caller cuts the power afterwards.
    async fn shutdown<U: ModemUart>(&self, engine: &AtEngine<U>, deadline: Instant) {
        engine.clear_urcs();
        if let Err(err) = self.call(engine, "^SMSO", deadline).await {
            warn!("^SMSO failed: {}", err);
            return;
        }
        let shutdown = engine
            .wait_urc(
                |urc| urc.starts_with("^SHUTDOWN"),
                budget(deadline, self.timeouts.shutdown),
            )
            .await;
        if shutdown.is_err() {
            warn!("No ^SHUTDOWN, cutting the power anyway");
        }
    }
}
