use core::{fmt::Display, str::FromStr};
use heapless::{String, Vec};

use crate::at::framer::AtOutcome;
use crate::error::Error;

/// Maximum length of a formatted command, including the `AT` prefix.
pub const AT_COMMAND_SIZE: usize = 128;
/// Maximum length of one response or URC line.
pub const AT_LINE_SIZE: usize = 128;
/// Maximum number of non-terminal lines kept for one command.
pub const AT_LINES: usize = 4;
const AT_VALUE_LEN: usize = 40;
const AT_VALUE_COUNT: usize = 16;

/// A response line of the form `+CMD: a,"b",c` or `^CMD: a,"b",c`.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResponse {
    line: String<AT_LINE_SIZE>,
    prefix_end: usize,
}

impl CommandResponse {
    pub fn new(line: &str) -> crate::Result<Self> {
        let (prefix, rest) = split_at_response(line).ok_or(Error::ParseError)?;
        Self::split_values(rest)?;
        Ok(Self {
            line: String::from_str(line).map_err(|_| Error::BufferTooSmallError)?,
            prefix_end: 1 + prefix.len(),
        })
    }

    /// Command name without the leading `+` or `^`.
    pub fn command(&self) -> &str {
        &self.line[1..self.prefix_end]
    }

    pub fn values(&self) -> Vec<&str, AT_VALUE_COUNT> {
        // Validated in `new`, cannot fail.
        Self::split_values(&self.line[self.prefix_end + 2..]).unwrap_or_default()
    }

    /// Parse out values out of a AT command response.
    ///
    /// Double quotes for strings are ignored. Numbers are returned as strings. For example,
    /// 1,"google.com",15 is parsed into ["1", "google.com", "15"].
    fn split_values(mut values: &str) -> Result<Vec<&str, AT_VALUE_COUNT>, Error> {
        let mut split = Vec::new();
        while !values.is_empty() {
            let pos = match values.chars().next() {
                Some('"') => {
                    if values.len() < 2 {
                        return Err(Error::ParseError);
                    }
                    let pos = values.find("\",").unwrap_or(values.len() - 1);
                    if pos == values.len() - 1 && !values.ends_with('"') {
                        return Err(Error::ParseError);
                    }
                    split.push(&values[1..pos]).map_err(|_| Error::BufferTooSmallError)?;
                    pos + 1
                }
                _ => {
                    let pos = values.find(',').unwrap_or(values.len());
                    split.push(&values[..pos]).map_err(|_| Error::BufferTooSmallError)?;
                    pos
                }
            };
            if pos >= values.len() {
                break;
            }
            values = &values[pos + 1..];
        }
        Ok(split)
    }

    /// Pick values from a command response given by the list of `indices`.
    fn pick_values<const N: usize>(
        &self,
        indices: [usize; N],
    ) -> Result<Vec<String<AT_VALUE_LEN>, N>, Error> {
        let values = self.values();
        indices
            .iter()
            .map(|idx| {
                let value = values.get(*idx).ok_or(Error::ModemError)?;
                String::from_str(value).map_err(|_| Error::BufferTooSmallError)
            })
            .collect()
    }

    pub fn parse_values<T: FromStr>(&self) -> Result<Vec<T, AT_VALUE_COUNT>, Error> {
        self.values()
            .iter()
            .map(|val| str::parse::<T>(val).map_err(|_| Error::ParseError))
            .collect::<Result<Vec<_, AT_VALUE_COUNT>, _>>()
    }
}

impl Display for CommandResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.line.trim())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for CommandResponse {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.line.as_str())
    }
}

/// Split `+CMD: rest` or `^CMD: rest` into `("CMD", "rest")`.
pub fn split_at_response(line: &str) -> Option<(&str, &str)> {
    if (line.starts_with('+') || line.starts_with('^'))
        && let Some(prefix_len) = line.find(": ")
    {
        let prefix = &line[1..prefix_len];
        let rest = &line[prefix_len + 2..];
        return Some((prefix, rest));
    }
    None
}

/// A non-terminal line received as part of a command response.
#[derive(Clone, Debug, PartialEq)]
pub enum FromModem {
    Line(String<AT_LINE_SIZE>),
    CommandResponse(CommandResponse),
}

impl FromModem {
    pub fn new(line: &str) -> crate::Result<Self> {
        match CommandResponse::new(line) {
            Ok(response) => Ok(FromModem::CommandResponse(response)),
            Err(_) => String::from_str(line)
                .map(FromModem::Line)
                .map_err(|_| Error::BufferTooSmallError),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FromModem::Line(line) => line.as_str(),
            FromModem::CommandResponse(response) => response.line.as_str(),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for FromModem {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.as_str())
    }
}

/// All lines of one completed command together with its terminal classification.
#[derive(Debug)]
pub struct AtResponse {
    lines: Vec<FromModem, AT_LINES>,
    outcome: AtOutcome,
    command: String<AT_COMMAND_SIZE>,
}

#[cfg(feature = "defmt")]
impl defmt::Format for AtResponse {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=[?]} {}", self.lines.as_slice(), self.outcome);
    }
}

impl Display for AtResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for line in &self.lines {
            write!(f, "{} ", line.as_str())?;
        }
        write!(f, "{}", self.outcome)
    }
}

impl AtResponse {
    /// `command` is the command text without the `AT` prefix, only the part before `=` or `?`
    /// is kept for matching response lines.
    pub fn new(lines: Vec<FromModem, AT_LINES>, outcome: AtOutcome, command: &str) -> Self {
        let pos = command.find(['=', '?']).unwrap_or(command.len());
        let mut prefix = String::new();
        // Prefix is shorter than the command, which already fit into the same capacity.
        let _ = prefix.push_str(&command[..pos]);
        Self {
            lines,
            outcome,
            command: prefix,
        }
    }

    pub fn lines(&self) -> &[FromModem] {
        self.lines.as_slice()
    }

    pub fn outcome(&self) -> &AtOutcome {
        &self.outcome
    }

    /// Returns a response to the command.
    ///
    /// If `filter` is None, it returns the first one.
    /// If `filter` is `(x, idx)`, returns the response with value `x` on position `idx`. If there
    /// is no such value, returns `ModemError`.
    fn response<T: FromStr + Eq>(
        &self,
        filter: Option<(T, usize)>,
    ) -> Result<&CommandResponse, Error> {
        let name = self.command.get(1..).unwrap_or_default();
        for line in &self.lines {
            if let FromModem::CommandResponse(command_response) = line
                && command_response.command() == name
            {
                match filter.as_ref() {
                    Some((t, idx)) => {
                        let values = command_response.values();
                        let val: Option<T> = values.get(*idx).and_then(|v| str::parse(v).ok());
                        if val.as_ref() == Some(t) {
                            return Ok(command_response);
                        }
                    }
                    None => return Ok(command_response),
                }
            }
        }
        Err(Error::ModemError)
    }

    /// Pick values from an AT response given by the list of `indices`.
    ///
    /// If filter is None, the first response line is chosen. If `filter` is provided, only the
    /// response for which the first chosen value (at position `indices[0]`) matches `filter`.
    fn pick_values<T: FromStr + Eq, const N: usize>(
        &self,
        indices: [usize; N],
        filter: Option<T>,
    ) -> Result<Vec<String<AT_VALUE_LEN>, N>, Error> {
        self.response(filter.map(|t| (t, indices[0])))?.pick_values(indices)
    }

    fn parse<T: FromStr>(s: &str) -> Result<T, Error> {
        str::parse(s).map_err(|_| Error::ParseError)
    }

    pub fn parse1<T: FromStr + Eq>(&self, indices: [usize; 1], filter: Option<T>) -> Result<T, Error> {
        let values = self.pick_values(indices, filter)?;
        Self::parse::<T>(&values[0])
    }

    pub fn parse2<T: FromStr + Eq, U: FromStr>(
        &self,
        indices: [usize; 2],
        filter: Option<T>,
    ) -> Result<(T, U), Error> {
        let values = self.pick_values(indices, filter)?;
        Ok((Self::parse::<T>(&values[0])?, Self::parse::<U>(&values[1])?))
    }

    pub fn parse4<T: FromStr + Eq, U: FromStr, V: FromStr, W: FromStr>(
        &self,
        indices: [usize; 4],
        filter: Option<T>,
    ) -> Result<(T, U, V, W), Error> {
        let values = self.pick_values(indices, filter)?;
        Ok((
            Self::parse::<T>(&values[0])?,
            Self::parse::<U>(&values[1])?,
            Self::parse::<V>(&values[2])?,
            Self::parse::<W>(&values[3])?,
        ))
    }

    pub fn parse5<T: FromStr + Eq, U: FromStr, V: FromStr, W: FromStr, X: FromStr>(
        &self,
        indices: [usize; 5],
        filter: Option<T>,
    ) -> Result<(T, U, V, W, X), Error> {
        let values = self.pick_values(indices, filter)?;
        Ok((
            Self::parse::<T>(&values[0])?,
            Self::parse::<U>(&values[1])?,
            Self::parse::<V>(&values[2])?,
            Self::parse::<W>(&values[3])?,
            Self::parse::<X>(&values[4])?,
        ))
    }
}
