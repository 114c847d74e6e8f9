use embassy_time::Duration;
use heapless::{String, format};
use serde::{Deserialize, Serialize};

use crate::at::response::AT_COMMAND_SIZE;

/// Radio access technology preference.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RatMode {
    /// Every technology the hardware supports, fastest first.
    #[default]
    Auto,
    Gsm,
    Umts,
    Lte,
}

/// Modem hardware variant.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HardwareRevision {
    /// 2G/3G only module.
    Ehs,
    /// 2G/3G/4G module.
    #[default]
    Pls,
}

impl HardwareRevision {
    pub fn supports_lte(self) -> bool {
        self == HardwareRevision::Pls
    }
}

/// Argument of `AT^SXRAT=` for `rat` on `hardware`.
///
/// Without LTE support a request for LTE is capped to UMTS.
pub fn rat_selection(rat: RatMode, hardware: HardwareRevision) -> &'static str {
    match (rat, hardware.supports_lte()) {
        (RatMode::Auto, true) => "4,3,2",
        (RatMode::Auto, false) => "1,2",
        (RatMode::Gsm, _) => "0",
        (RatMode::Umts, _) | (RatMode::Lte, false) => "2",
        (RatMode::Lte, true) => "3",
    }
}

/// Persisted connection parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Baud rate the link should run at once the modem answers.
    pub baud_rate: u32,
    pub rat: RatMode,
    pub hardware: HardwareRevision,
    /// SIM PIN, used only when it is exactly 4 digits.
    pub pin: Option<String<8>>,
    /// Access point name (APN)
    pub apn: String<30>,
    pub provider_profile: u8,
    pub service_profile: u8,
    pub host: String<64>,
    pub port: u16,
    /// Minimum acceptable quality on the 0-9 scale.
    pub min_quality: u8,
    /// Overall budget of a connect sequence.
    pub connect_budget_secs: u16,
    /// Overall budget of a teardown sequence.
    pub terminate_budget_secs: u16,
    /// Inactivity timer of the socket, in seconds.
    pub socket_timer_secs: u16,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            rat: RatMode::Auto,
            hardware: HardwareRevision::Pls,
            pin: None,
            apn: String::try_from("internet").unwrap_or_default(),
            provider_profile: 0,
            service_profile: 1,
            host: String::new(),
            port: 0,
            min_quality: 3,
            connect_budget_secs: 180,
            terminate_budget_secs: 30,
            socket_timer_secs: 60,
        }
    }
}

impl ModemConfig {
    /// The PIN to enter, if it is well-formed.
    pub fn valid_pin(&self) -> Option<&str> {
        self.pin
            .as_deref()
            .filter(|pin| pin.len() == 4 && pin.bytes().all(|b| b.is_ascii_digit()))
    }

    /// Address of the service profile: a TCP client socket with transparent-mode ETX handling.
    pub fn service_address(&self) -> crate::Result<String<AT_COMMAND_SIZE>> {
        Ok(format!(
            AT_COMMAND_SIZE;
            "socktcp://{}:{};etx;timer={}",
            self.host,
            self.port,
            self.socket_timer_secs
        )?)
    }

    pub fn connect_budget(&self) -> Duration {
        Duration::from_secs(self.connect_budget_secs.into())
    }

    pub fn terminate_budget(&self) -> Duration {
        Duration::from_secs(self.terminate_budget_secs.into())
    }
}

/// Waits of the individual connect phases. Each one is further capped by the overall budget.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    /// An ordinary command.
    pub command: Duration,
    /// One probe of the baud-rate discovery.
    pub probe: Duration,
    /// `^SYSSTART` after power-on.
    pub ready: Duration,
    /// `+PBREADY` after device configuration.
    pub phonebook: Duration,
    /// Total time spent polling the serving cell.
    pub signal: Duration,
    /// Pause between two serving-cell polls.
    pub signal_poll: Duration,
    /// `^SISW` after opening the socket.
    pub session: Duration,
    /// The `OK` after toggling DTR.
    pub exit_transparent: Duration,
    /// `^SHUTDOWN` after `^SMSO`.
    pub shutdown: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(1),
            probe: Duration::from_millis(300),
            ready: Duration::from_secs(10),
            phonebook: Duration::from_secs(20),
            signal: Duration::from_secs(30),
            signal_poll: Duration::from_secs(1),
            session: Duration::from_secs(30),
            exit_transparent: Duration::from_secs(2),
            shutdown: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod test_config {
    use super::*;
    use postcard::{from_bytes, to_vec};

    #[test]
    fn test_rat_selection() {
        assert_eq!(rat_selection(RatMode::Auto, HardwareRevision::Pls), "4,3,2");
        assert_eq!(rat_selection(RatMode::Auto, HardwareRevision::Ehs), "1,2");
        assert_eq!(rat_selection(RatMode::Lte, HardwareRevision::Pls), "3");
        assert_eq!(rat_selection(RatMode::Lte, HardwareRevision::Ehs), "2");
        assert_eq!(rat_selection(RatMode::Gsm, HardwareRevision::Ehs), "0");
    }

    #[test]
    fn test_valid_pin() {
        let mut config = ModemConfig::default();
        assert_eq!(config.valid_pin(), None);
        config.pin = Some("1234".try_into().unwrap());
        assert_eq!(config.valid_pin(), Some("1234"));
        config.pin = Some("12345".try_into().unwrap());
        assert_eq!(config.valid_pin(), None);
        config.pin = Some("12a4".try_into().unwrap());
        assert_eq!(config.valid_pin(), None);
    }

    #[test]
    fn test_service_address() {
        let config = ModemConfig {
            host: "telemetry.example.org".try_into().unwrap(),
            port: 7001,
            ..Default::default()
        };
        assert_eq!(
            config.service_address().unwrap().as_str(),
            "socktcp://telemetry.example.org:7001;etx;timer=60"
        );
    }

    #[test]
    fn test_config_storage() {
        let config = ModemConfig {
            pin: Some("0000".try_into().unwrap()),
            apn: "iot.1nce.net".try_into().unwrap(),
            rat: RatMode::Umts,
            hardware: HardwareRevision::Ehs,
            ..Default::default()
        };
        let bytes = to_vec::<_, 256>(&config).unwrap();
        let stored: ModemConfig = from_bytes(&bytes).unwrap();
        assert_eq!(stored, config);
    }
}
