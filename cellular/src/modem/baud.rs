#[cfg(feature = "defmt")]
use defmt::{debug, info, warn};
use embassy_time::{Duration, Instant};
use heapless::format;
#[cfg(not(feature = "defmt"))]
use log::{debug, info, warn};

use crate::at::engine::AtEngine;
use crate::at::uart::ModemUart;
use crate::error::Error;
use crate::modem::budget;

/// Baud rates tried by [`discover`], most likely first.
pub const BAUD_CANDIDATES: [u32; 8] = [115_200, 230_400, 460_800, 57_600, 38_400, 19_200, 9_600, 921_600];

/// Probes sent by [`verify_link`]. The first ones may fail right after a rate change.
const VERIFY_PROBES: usize = 3;

/// Sends one `AT`, true if it was answered with `OK`.
pub async fn probe<U: ModemUart>(engine: &AtEngine<U>, timeout: Duration) -> bool {
    match engine.send(Some(""), timeout, None).await {
        Ok(response) => response.outcome().is_success(),
        Err(err) => {
            debug!("Probe failed: {}", err);
            false
        }
    }
}

/// Finds the rate the modem answers at, switches it to `desired` and verifies the link.
///
/// Gives up with `TimeoutError` once `deadline` has passed.
pub async fn discover<U: ModemUart>(
    engine: &AtEngine<U>,
    desired: u32,
    probe_timeout: Duration,
    command_timeout: Duration,
    deadline: Instant,
) -> crate::Result<u32> {
    let mut found = None;
    for baud_rate in BAUD_CANDIDATES {
        if Instant::now() >= deadline {
            break;
        }
        engine.set_baud_rate(baud_rate);
        if probe(engine, budget(deadline, probe_timeout)).await {
            found = Some(baud_rate);
            break;
        }
    }
    let Some(found) = found else {
        warn!("Modem does not answer at any baud rate");
        return Err(Error::TimeoutError);
    };
    info!("Modem answers at {} baud", found);
    if found != desired {
        let command = format!(24; "+IPR={}", desired)?;
        engine.call_at(&command, budget(deadline, command_timeout)).await?;
        engine.set_baud_rate(desired);
        info!("Link switched to {} baud", desired);
    }
    verify_link(engine, probe_timeout, deadline).await?;
    Ok(desired)
}

/// Probes the link a few times, only the last probe has to succeed.
pub async fn verify_link<U: ModemUart>(
    engine: &AtEngine<U>,
    probe_timeout: Duration,
    deadline: Instant,
) -> crate::Result<()> {
    let mut answered = false;
    for _ in 0..VERIFY_PROBES {
        answered = probe(engine, budget(deadline, probe_timeout)).await;
    }
    if answered {
        Ok(())
    } else {
        Err(Error::TimeoutError)
    }
}
