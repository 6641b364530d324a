use rppal::gpio::{Gpio, OutputPin};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Indicator;

#[derive(Debug, thiserror::Error)]
pub enum IndicatorError {
    #[error("GPIO unavailable: {0}")]
    Gpio(#[from] rppal::gpio::Error),
}

/// LED on a GPIO pin. The boards this runs on wire LEDs to the supply rail,
/// so driving the pin low lights it.
pub struct GpioIndicator {
    pin: Mutex<OutputPin>,
    active_low: bool,
}

impl GpioIndicator {
    pub fn open(bcm_pin: u8, active_low: bool) -> Result<Self, IndicatorError> {
        let mut pin = Gpio::new()?.get(bcm_pin)?.into_output();
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!("Indicator LED on GPIO {}", bcm_pin);
        Ok(Self {
            pin: Mutex::new(pin),
            active_low,
        })
    }
}

impl Indicator for GpioIndicator {
    fn set(&self, on: bool) {
        let mut pin = self.pin.lock().unwrap_or_else(|e| e.into_inner());
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

/// Stand-in when no LED is configured or GPIO is unavailable
pub struct NoIndicator;

impl Indicator for NoIndicator {
    fn set(&self, _on: bool) {}
}

/// Blink pattern of the heartbeat LED
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub off: Duration,
    pub on: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            off: Duration::from_millis(800),
            on: Duration::from_millis(200),
        }
    }
}

pub fn spawn_heartbeat(
    indicator: Arc<dyn Indicator>,
    pattern: Heartbeat,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            indicator.set(false);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pattern.off) => {}
            }
            indicator.set(true);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pattern.on) => {}
            }
        }
        indicator.set(false);
        debug!("Heartbeat stopped");
    })
}
