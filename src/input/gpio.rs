//! GPIO line glue
//!
//! Claims the physical lines and runs the blocking interrupt-poll loops
//! that feed raw edges (buttons) and line-level snapshots (encoder) into
//! the async decoders. Failing to acquire a line is fatal at construction;
//! runtime poll errors are logged and the loop retries on the next tick,
//! since transient interrupt-wait timeouts are expected and benign.

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, InputPin, Trigger};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use super::button::RawEdge;

/// Interrupt wait timeout; doubles as the retry tick after poll errors
pub const EVENT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Claim an input line with both-edge interrupts armed
///
/// Fatal on failure: a missing line means miswired or misconfigured
/// hardware and the process must not limp along without its inputs.
pub fn claim_input_pin(gpio: &Gpio, pin: u8, pull_up: bool) -> Result<InputPin> {
    let pin = gpio
        .get(pin)
        .with_context(|| format!("Failed to acquire GPIO pin {}", pin))?;
    let mut pin = if pull_up {
        pin.into_input_pullup()
    } else {
        pin.into_input_pulldown()
    };
    pin.set_interrupt(Trigger::Both, None)
        .with_context(|| format!("Failed to arm interrupts on GPIO pin {}", pin.pin()))?;
    Ok(pin)
}

/// Forward raw button edges into `tx` until the receiver goes away
///
/// Blocking; run on a dedicated blocking task.
pub fn watch_button_edges(mut pin: InputPin, tx: mpsc::Sender<RawEdge>) {
    loop {
        match pin.poll_interrupt(true, Some(EVENT_WAIT_TIMEOUT)) {
            Ok(Some(event)) => {
                let edge = match event.trigger {
                    Trigger::RisingEdge => RawEdge::Rising,
                    Trigger::FallingEdge => RawEdge::Falling,
                    _ => continue,
                };
                if tx.blocking_send(edge).is_err() {
                    return;
                }
            },
            Ok(None) => continue, // wait timeout, nothing pending
            Err(e) => warn!("GPIO wait error on pin {}: {}", pin.pin(), e),
        }
    }
}

/// Forward `(line_a, line_b)` level snapshots into `tx` on every edge of
/// either encoder line, until the receiver goes away
///
/// Blocking; run on a dedicated blocking task.
pub fn watch_encoder_levels(
    gpio: Gpio,
    pin_a: InputPin,
    pin_b: InputPin,
    tx: mpsc::Sender<(bool, bool)>,
) {
    loop {
        match gpio.poll_interrupts(&[&pin_a, &pin_b], false, Some(EVENT_WAIT_TIMEOUT)) {
            Ok(Some(_)) => {
                if tx.blocking_send((pin_a.is_high(), pin_b.is_high())).is_err() {
                    return;
                }
            },
            Ok(None) => continue,
            Err(e) => warn!(
                "GPIO wait error on pins {}/{}: {}",
                pin_a.pin(),
                pin_b.pin(),
                e
            ),
        }
    }
}
