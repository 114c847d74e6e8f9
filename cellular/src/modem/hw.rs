/// Power switch of the modem, implemented by the board support code.
pub trait ModemPower {
    /// Drives the power/ignition line.
    fn set_power(&mut self, on: bool);

    /// Reads back the power-good indication of the modem supply.
    fn power_good(&mut self) -> bool;
}
