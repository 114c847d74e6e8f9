use crate::at::response::split_at_response;
use crate::error::Error;

/// Highest value of the normalized signal quality.
pub const MAX_QUALITY: u8 = 9;

/// 3G quality by RSCP row (-112 dBm to -82 dBm, 2 dB steps) and EC/n0 column (-18 dB to
/// -4.5 dB, 1.5 dB steps).
const UMTS_QUALITY: [[u8; 10]; 16] = [
    [0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 2, 2, 2, 2, 2, 2],
    [0, 1, 2, 2, 2, 2, 3, 3, 3, 3],
    [0, 1, 2, 2, 3, 3, 3, 4, 4, 4],
    [0, 2, 2, 3, 3, 3, 4, 4, 4, 5],
    [0, 2, 2, 3, 3, 4, 4, 5, 5, 5],
    [0, 2, 3, 3, 4, 4, 5, 5, 5, 6],
    [0, 2, 3, 4, 4, 5, 5, 5, 6, 6],
    [0, 2, 3, 4, 4, 5, 5, 6, 6, 7],
    [0, 2, 3, 4, 5, 5, 6, 6, 7, 7],
    [0, 2, 3, 4, 5, 5, 6, 6, 7, 7],
    [0, 3, 4, 4, 5, 6, 6, 7, 7, 8],
    [0, 3, 4, 5, 5, 6, 7, 7, 8, 8],
    [0, 3, 4, 5, 6, 6, 7, 7, 8, 8],
    [0, 3, 4, 5, 6, 6, 7, 8, 8, 9],
    [0, 3, 4, 5, 6, 7, 7, 8, 8, 9],
];

/// 4G quality by RSRP row (-120 dBm to -95 dBm, 5 dB steps) and RSRQ column (-13.5 dB to
/// -10 dB, 0.5 dB steps).
const LTE_QUALITY: [[u8; 8]; 6] = [
    [0, 0, 0, 0, 0, 0, 0, 0],
    [0, 2, 2, 3, 3, 3, 4, 4],
    [0, 2, 3, 4, 4, 5, 5, 6],
    [0, 3, 4, 5, 5, 6, 6, 7],
    [0, 3, 4, 5, 6, 7, 7, 8],
    [0, 3, 5, 6, 7, 8, 8, 9],
];

/// Radio access technology of the serving cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Technology {
    #[default]
    Unknown,
    Gsm,
    Umts,
    Lte,
}

/// Registration state reported at the end of a serving-cell line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CellState {
    /// Dedicated channel in use.
    Connected,
    /// Camping on the cell, idle.
    NotConnected,
    /// Camping, emergency calls only.
    LimitedService,
    Searching,
    Unknown,
}

impl CellState {
    fn parse(field: &str) -> Self {
        match field.trim() {
            "CONN" => CellState::Connected,
            "NOCONN" => CellState::NotConnected,
            "LIMSRV" => CellState::LimitedService,
            "SEARCH" => CellState::Searching,
            _ => CellState::Unknown,
        }
    }

    /// Radio metrics are only meaningful while camping on a cell.
    pub fn has_measurements(self) -> bool {
        matches!(
            self,
            CellState::Connected | CellState::NotConnected | CellState::LimitedService
        )
    }
}

/// Decoded `^SMONI` serving-cell line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServingCell {
    pub technology: Technology,
    pub state: CellState,
    /// 0-9, `None` if the line carries no usable measurement.
    pub quality: Option<u8>,
}

impl ServingCell {
    /// Parses a serving-cell line, with or without the `^SMONI: ` prefix.
    pub fn parse(line: &str) -> Self {
        let values = split_at_response(line).map(|(_, rest)| rest).unwrap_or(line);
        let fields = || values.split(',').map(str::trim);
        let technology = match fields().next() {
            Some("2G") => Technology::Gsm,
            Some("3G") => Technology::Umts,
            Some("4G") => Technology::Lte,
            _ => Technology::Unknown,
        };
        let state = fields().next_back().map_or(CellState::Unknown, CellState::parse);
        let field = |idx: usize| fields().nth(idx);

        let quality = if state.has_measurements() {
            match technology {
                Technology::Gsm => field(2).and_then(parse_int).map(gsm_quality),
                Technology::Umts => {
                    let ec_n0 = field(3).and_then(parse_tenths);
                    let rscp = field(4).and_then(parse_int);
                    rscp.zip(ec_n0).map(|(rscp, ec_n0)| umts_quality(rscp, ec_n0))
                }
                Technology::Lte => {
                    let rsrp = field(12).and_then(parse_int);
                    let rsrq = field(13).and_then(parse_tenths);
                    rsrp.zip(rsrq).map(|(rsrp, rsrq)| lte_quality(rsrp, rsrq))
                }
                Technology::Unknown => None,
            }
        } else {
            None
        };

        Self {
            technology,
            state,
            quality,
        }
    }

    /// Quality, or `NoSignalData` if there is none.
    pub fn quality(&self) -> crate::Result<u8> {
        self.quality.ok_or(Error::NoSignalData)
    }
}

fn parse_int(field: &str) -> Option<i32> {
    field.parse().ok()
}

/// Parses a decimal with at most one fractional digit, e.g. `-16.5`, into tenths.
fn parse_tenths(field: &str) -> Option<i32> {
    let (int, frac) = field.split_once('.').unwrap_or((field, "0"));
    if frac.len() != 1 {
        return None;
    }
    let int: i32 = int.parse().ok()?;
    let frac: i32 = frac.parse().ok()?;
    let negative = int < 0 || (int == 0 && field.starts_with('-'));
    Some(if negative {
        int * 10 - frac
    } else {
        int * 10 + frac
    })
}

/// Rescales the received level in dBm linearly from -110..-65 into 0-9.
pub fn gsm_quality(rssi_dbm: i32) -> u8 {
    ((rssi_dbm.clamp(-110, -65) + 110) / 5) as u8
}

/// `rscp_dbm` in dBm, `ec_n0` in tenths of dB.
pub fn umts_quality(rscp_dbm: i32, ec_n0: i32) -> u8 {
    let row = (rscp_dbm.clamp(-112, -82) + 112) / 2;
    let col = (ec_n0.clamp(-180, -45) + 180) / 15;
    UMTS_QUALITY[row as usize][col as usize]
}

/// `rsrp_dbm` in dBm, `rsrq` in tenths of dB.
pub fn lte_quality(rsrp_dbm: i32, rsrq: i32) -> u8 {
    let row = (rsrp_dbm.clamp(-120, -95) + 120) / 5;
    let col = (rsrq.clamp(-135, -100) + 135) / 5;
    LTE_QUALITY[row as usize][col as usize]
}

/// Parses a `+CSQ: <rssi>,<ber>` line. Returns `None` for "not known" (99).
pub fn parse_csq(line: &str) -> crate::Result<Option<u8>> {
    let (_, values) = split_at_response(line).ok_or(Error::ParseError)?;
    let rssi = values
        .split(',')
        .next()
        .and_then(|rssi| rssi.trim().parse::<u8>().ok())
        .ok_or(Error::ParseError)?;
    Ok((rssi != 99).then_some(rssi))
}
