//! PCA9685 16-channel 12-bit PWM module over I2C.

use rppal::i2c::I2c;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use super::{HardwareError, PwmChannels, MAX_DUTY_CYCLE};

const MODE1: u8 = 0x00;
const MODE2: u8 = 0x04;
const PRESCALE: u8 = 0xFE;
const LED0_ON_L: u8 = 0x06;

// MODE1 bits
const ALLCALL: u8 = 0x01;
const SLEEP: u8 = 0x10;
const AUTO_INCREMENT: u8 = 0x20;
const RESTART: u8 = 0x80;

// MODE2 bits
const OUTDRV: u8 = 0x04;

const OSCILLATOR_HZ: f64 = 25_000_000.0;

pub struct Pca9685 {
    i2c: I2c,
    address: u16,
}

impl Pca9685 {
    /// Opens the module at the given I2C address and programs the PWM
    /// frequency. The higher the frequency, the smoother the light looks.
    pub fn new(address: u16, frequency_hz: u16) -> Result<Self, HardwareError> {
        let mut i2c = I2c::new().map_err(|e| HardwareError::I2c(e.to_string()))?;
        i2c.set_slave_address(address)
            .map_err(|e| HardwareError::I2c(e.to_string()))?;

        let mut module = Pca9685 { i2c, address };
        module.write_register(MODE2, OUTDRV)?;
        module.write_register(MODE1, ALLCALL | AUTO_INCREMENT)?;
        thread::sleep(Duration::from_millis(5));

        // Clear SLEEP so the oscillator starts.
        let mode1 = module.read_register(MODE1)? & !SLEEP;
        module.write_register(MODE1, mode1)?;
        thread::sleep(Duration::from_millis(5));

        module.set_frequency(frequency_hz)?;
        info!(
            "Initialized PCA9685 at 0x{:02x} with {} Hz PWM",
            address, frequency_hz
        );
        Ok(module)
    }

    fn set_frequency(&mut self, frequency_hz: u16) -> Result<(), HardwareError> {
        let prescale = (OSCILLATOR_HZ / (4096.0 * frequency_hz as f64)).round() as u8 - 1;
        debug!(
            "PCA9685 0x{:02x}: prescale {} for {} Hz",
            self.address, prescale, frequency_hz
        );

        // The prescaler can only be written while the oscillator sleeps.
        let mode1 = self.read_register(MODE1)?;
        self.write_register(MODE1, (mode1 & !RESTART) | SLEEP)?;
        self.write_register(PRESCALE, prescale)?;
        self.write_register(MODE1, mode1)?;
        thread::sleep(Duration::from_millis(5));
        self.write_register(MODE1, mode1 | RESTART)?;
        Ok(())
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), HardwareError> {
        self.i2c
            .smbus_write_byte(register, value)
            .map_err(|e| HardwareError::I2c(e.to_string()))
    }

    fn read_register(&mut self, register: u8) -> Result<u8, HardwareError> {
        self.i2c
            .smbus_read_byte(register)
            .map_err(|e| HardwareError::I2c(e.to_string()))
    }
}

impl PwmChannels for Pca9685 {
    fn set_channel(&mut self, channel: u8, duty: u16) -> Result<(), HardwareError> {
        if channel > 15 {
            return Err(HardwareError::BadChannel(channel));
        }
        let duty = duty.min(MAX_DUTY_CYCLE);
        let registers = [0, 0, (duty & 0xFF) as u8, (duty >> 8) as u8];
        self.i2c
            .block_write(LED0_ON_L + 4 * channel, &registers)
            .map_err(|e| HardwareError::I2c(e.to_string()))
    }
}
