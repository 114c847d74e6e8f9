use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("Buffer too small")]
    BufferTooSmallError,
    #[error("Cannot parse string as the given type")]
    ParseError,
    #[error("Formatting error")]
    FormatError,
    #[error("Modem error")]
    ModemError,
    #[error("Timeout error")]
    TimeoutError,
    #[error("A command is already in flight")]
    Busy,
    #[error("Transport is in the wrong mode for this operation")]
    WrongState,
    #[error("AT error response")]
    AtErrorResponse,
    #[error("Callback registry is full")]
    RegistryFull,
    #[error("No signal quality available")]
    NoSignalData,
}

impl From<core::fmt::Error> for Error {
    fn from(_: core::fmt::Error) -> Self {
        Error::FormatError
    }
}
