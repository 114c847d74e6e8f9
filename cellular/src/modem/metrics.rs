use embassy_time::{Duration, Instant};

use crate::modem::quality::Technology;

/// Named points of a connect/teardown sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Milestone {
    Start = 0,
    PowerOn,
    TransportReady,
    DeviceConfigured,
    ProviderConfigured,
    ServiceConfigured,
    SignalAssessed,
    Connected,
    Disconnected,
    Deregistered,
    PoweredOff,
}

pub const MILESTONES: usize = 11;

impl Milestone {
    pub const ALL: [Milestone; MILESTONES] = [
        Milestone::Start,
        Milestone::PowerOn,
        Milestone::TransportReady,
        Milestone::DeviceConfigured,
        Milestone::ProviderConfigured,
        Milestone::ServiceConfigured,
        Milestone::SignalAssessed,
        Milestone::Connected,
        Milestone::Disconnected,
        Milestone::Deregistered,
        Milestone::PoweredOff,
    ];
}

/// Signal measured before connecting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SignalSample {
    /// Raw `+CSQ` RSSI, `None` if unknown.
    pub csq: Option<u8>,
    /// Normalized serving-cell quality, 0-9.
    pub quality: Option<u8>,
}

/// Byte counters of the service profile, from `^SISI`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketCounters {
    pub received: u32,
    pub sent: u32,
    pub acknowledged: u32,
    pub unacknowledged: u32,
}

/// Outcome record of one connect (and the following teardown).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    pub technology: Technology,
    pub signal: SignalSample,
    pub counters: SocketCounters,
    timestamps: [Option<Duration>; MILESTONES],
    valid: bool,
}

impl ConnectionMetrics {
    /// Time of `milestone` relative to [`Milestone::Start`].
    pub fn timestamp(&self, milestone: Milestone) -> Option<Duration> {
        self.timestamps[milestone as usize]
    }

    /// True only if every milestone up to the last one reached was captured.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ConnectionMetrics {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "{} {} {} valid={}",
            self.technology,
            self.signal,
            self.counters,
            self.valid
        );
    }
}

/// Writes [`ConnectionMetrics`], owned by the orchestrator.
#[derive(Default)]
pub struct MetricsRecorder {
    start: Option<Instant>,
    metrics: ConnectionMetrics,
}

impl MetricsRecorder {
    /// Clears everything and marks [`Milestone::Start`] now.
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.metrics = ConnectionMetrics {
            valid: true,
            ..Default::default()
        };
        self.mark(Milestone::Start);
    }

    pub fn mark(&mut self, milestone: Milestone) {
        match self.start {
            Some(start) => {
                self.metrics.timestamps[milestone as usize] = Some(Instant::now() - start);
            }
            None => self.metrics.valid = false,
        }
    }

    pub fn invalidate(&mut self) {
        self.metrics.valid = false;
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut ConnectionMetrics {
        &mut self.metrics
    }
}
