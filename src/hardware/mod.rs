//! # Hardware Output Module
//!
//! ## Why This Module Exists
//! Turns the desired state in the settings store into actual light: two
//! PCA9685 16-channel PWM modules on the Raspberry Pi's I2C bus, one wired
//! to the white LED shelves and one to the RGB fixtures. The driver loop
//! reads the live store and the day/night schedule on a fixed tick and
//! rewrites every channel; a failed tick is retried on the next one, so the
//! message-handling path never waits on hardware.
//!
//! The [`PwmChannels`] trait is the seam between the effective-value logic
//! and the bus, so the same driver runs against real modules, a logging dummy
//! for development off the Pi, and recording fakes in tests.

pub mod driver;
pub mod pca9685;

use thiserror::Error;
use tracing::debug;

/// Largest duty value the PCA9685 accepts (12-bit resolution).
pub const MAX_DUTY_CYCLE: u16 = 4095;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("I2C bus failure: {0}")]
    I2c(String),

    #[error("PWM channel out of range: {0}")]
    BadChannel(u8),
}

/// A bank of PWM output channels.
pub trait PwmChannels: Send {
    /// Holds the channel at the given duty value (0..=4095).
    fn set_channel(&mut self, channel: u8, duty: u16) -> Result<(), HardwareError>;
}

/// Stand-in output for running without the I2C bus; logs instead of writing.
#[derive(Debug)]
pub struct DummyChannels {
    name: &'static str,
}

impl DummyChannels {
    pub fn new(name: &'static str) -> Self {
        DummyChannels { name }
    }
}

impl PwmChannels for DummyChannels {
    fn set_channel(&mut self, channel: u8, duty: u16) -> Result<(), HardwareError> {
        debug!("[dummy {}] channel {} duty {}", self.name, channel, duty);
        Ok(())
    }
}
