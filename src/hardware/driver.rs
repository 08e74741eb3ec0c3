//! Per-tick light refresh.
//!
//! On every tick the driver reads a snapshot of the live store plus the
//! current schedule phase and rewrites every PWM channel: manual overrides
//! win over the schedule, the rack's RGB unit wins over its shared shelf-3
//! LED, and RGB fixtures are blacked out during the sunrise/sunset ramps.

use std::sync::Arc;

use chrono::{Local, NaiveTime};
use tokio::sync::RwLock;
use tracing::trace;

use super::{HardwareError, PwmChannels, MAX_DUTY_CYCLE};
use crate::schedule::{duty, DayPhase, SunSchedule};
use crate::settings::{Position, RackId, SettingsStore, ShelfId};

/// Which PWM channel each shelf's LED strip is wired to (module 0).
fn led_channel(shelf: ShelfId) -> u8 {
    match (shelf.rack, shelf.position) {
        (RackId::A, Position::P1) => 11,
        (RackId::A, Position::P2) => 10,
        (RackId::A, Position::P3) => 9,
        (RackId::B, Position::P1) => 0,
        (RackId::B, Position::P2) => 1,
        (RackId::B, Position::P3) => 2,
        (RackId::C, Position::P1) => 3,
        (RackId::C, Position::P2) => 4,
        (RackId::C, Position::P3) => 5,
    }
}

/// Which channel triple drives each rack's RGB fixture (module 1).
fn rgb_channels(rack: RackId) -> [u8; 3] {
    match rack {
        RackId::A => [8, 9, 10],
        RackId::B => [0, 1, 2],
        RackId::C => [4, 5, 6],
    }
}

pub struct LightDriver {
    schedule: SunSchedule,
    settings: Arc<RwLock<SettingsStore>>,
    led_out: Box<dyn PwmChannels>,
    rgb_out: Box<dyn PwmChannels>,
}

impl LightDriver {
    pub fn new(
        schedule: SunSchedule,
        settings: Arc<RwLock<SettingsStore>>,
        led_out: Box<dyn PwmChannels>,
        rgb_out: Box<dyn PwmChannels>,
    ) -> Self {
        LightDriver {
            schedule,
            settings,
            led_out,
            rgb_out,
        }
    }

    /// Refreshes every fixture against the wall clock. Errors are reported
    /// to the caller, who retries on the next tick.
    pub async fn refresh(&mut self) -> Result<(), HardwareError> {
        self.refresh_at(Local::now().time()).await
    }

    pub async fn refresh_at(&mut self, now: NaiveTime) -> Result<(), HardwareError> {
        let (phase, fraction) = self.schedule.phase_at(now);
        // Snapshot so the I2C writes happen without holding the store lock.
        let snapshot = self.settings.read().await.snapshot();
        trace!("Refreshing fixtures, phase {:?} fraction {:.3}", phase, fraction);

        for shelf in ShelfId::all() {
            let value = effective_led_duty(&snapshot, shelf, fraction);
            self.led_out.set_channel(led_channel(shelf), value)?;
        }

        for rack in RackId::ALL {
            let values = effective_rgb_duty(&snapshot, rack, phase);
            let channels = rgb_channels(rack);
            for (channel, value) in channels.into_iter().zip(values) {
                self.rgb_out.set_channel(channel, value)?;
            }
        }

        Ok(())
    }
}

/// Effective duty for one shelf: the manual brightness when overridden,
/// otherwise the scheduled fraction, except that a shared slot whose rack
/// has an RGB override stays dark regardless of schedule.
fn effective_led_duty(store: &SettingsStore, shelf: ShelfId, fraction: f64) -> u16 {
    let led = store.led(shelf);
    if led.manual_override {
        duty(led.brightness as f64 / 100.0, MAX_DUTY_CYCLE)
    } else if shelf.is_shared_slot() && store.rgb(shelf.rack).manual_override {
        0
    } else {
        duty(fraction, MAX_DUTY_CYCLE)
    }
}

/// Effective duty triple for one rack's RGB fixture. Manual color only; the
/// fixture is forced off without an override and during both ramp phases.
fn effective_rgb_duty(store: &SettingsStore, rack: RackId, phase: DayPhase) -> [u16; 3] {
    let rgb = store.rgb(rack);
    if rgb.manual_override && !phase.is_ramp() {
        [
            duty(rgb.color.r as f64 / 255.0, MAX_DUTY_CYCLE),
            duty(rgb.color.g as f64 / 255.0, MAX_DUTY_CYCLE),
            duty(rgb.color.b as f64 / 255.0, MAX_DUTY_CYCLE),
        ]
    } else {
        [0, 0, 0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleConfig;
    use crate::settings::ColorValue;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recording {
        writes: Arc<Mutex<Vec<(u8, u16)>>>,
    }

    impl Recording {
        fn take(&self) -> Vec<(u8, u16)> {
            std::mem::take(&mut *self.writes.lock().unwrap())
        }
    }

    impl PwmChannels for Recording {
        fn set_channel(&mut self, channel: u8, duty: u16) -> Result<(), HardwareError> {
            self.writes.lock().unwrap().push((channel, duty));
            Ok(())
        }
    }

    fn shelf(id: &str) -> ShelfId {
        id.parse().unwrap()
    }

    fn schedule() -> SunSchedule {
        SunSchedule::from_config(&ScheduleConfig::default()).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn led_duty_prefers_override_then_rgb_priority_then_schedule() {
        let mut store = SettingsStore::new("test");

        // Scheduled: follows the fraction.
        assert_eq!(effective_led_duty(&store, shelf("A1"), 1.0), 4095);
        assert_eq!(effective_led_duty(&store, shelf("A1"), 0.5), 2048);

        // Manual override: fixed percentage, schedule ignored.
        store.set_led_control(shelf("A1"), true);
        store.set_led_brightness(shelf("A1"), 50);
        assert_eq!(effective_led_duty(&store, shelf("A1"), 0.0), 2048);

        // Shared slot stays dark while the rack's RGB unit owns it.
        store.set_rgb_control(RackId::A, true);
        assert_eq!(effective_led_duty(&store, shelf("A3"), 1.0), 0);
        // A non-shared shelf of the same rack is unaffected.
        assert_eq!(effective_led_duty(&store, shelf("A2"), 1.0), 4095);
    }

    #[test]
    fn rgb_duty_requires_override_and_no_ramp() {
        let mut store = SettingsStore::new("test");
        store.set_rgb_control(RackId::B, true);
        store.set_rgb_color(RackId::B, &ColorValue::parse("RGBA(255,0,51, 255)").unwrap());

        assert_eq!(
            effective_rgb_duty(&store, RackId::B, DayPhase::Day),
            [4095, 0, 819]
        );
        assert_eq!(
            effective_rgb_duty(&store, RackId::B, DayPhase::Night),
            [4095, 0, 819]
        );

        // Ramps black the fixture out even under override.
        assert_eq!(
            effective_rgb_duty(&store, RackId::B, DayPhase::SunriseRamp),
            [0, 0, 0]
        );
        assert_eq!(
            effective_rgb_duty(&store, RackId::B, DayPhase::SunsetRamp),
            [0, 0, 0]
        );

        // No override, no light.
        store.set_rgb_control(RackId::B, false);
        assert_eq!(effective_rgb_duty(&store, RackId::B, DayPhase::Day), [0, 0, 0]);
    }

    #[tokio::test]
    async fn refresh_writes_every_wired_channel() {
        let settings = Arc::new(RwLock::new(SettingsStore::new("live")));
        let leds = Recording::default();
        let rgbs = Recording::default();
        let mut driver = LightDriver::new(
            schedule(),
            settings.clone(),
            Box::new(leds.clone()),
            Box::new(rgbs.clone()),
        );

        driver.refresh_at(at(12, 0)).await.unwrap();

        let led_writes = leds.take();
        assert_eq!(led_writes.len(), 9);
        // Midday, no overrides: every shelf at full duty on its wired channel.
        assert!(led_writes.contains(&(11, 4095))); // A1
        assert!(led_writes.contains(&(2, 4095))); // B3
        assert!(led_writes.contains(&(5, 4095))); // C3

        let rgb_writes = rgbs.take();
        assert_eq!(rgb_writes.len(), 9);
        assert!(rgb_writes.iter().all(|&(_, duty)| duty == 0));
    }

    #[tokio::test]
    async fn refresh_honors_the_forced_dark_state() {
        let settings = Arc::new(RwLock::new(SettingsStore::new("live")));
        settings.write().await.turn_all_off();
        let leds = Recording::default();
        let rgbs = Recording::default();
        let mut driver = LightDriver::new(
            schedule(),
            settings.clone(),
            Box::new(leds.clone()),
            Box::new(rgbs.clone()),
        );

        // Midday would normally mean full brightness everywhere.
        driver.refresh_at(at(12, 0)).await.unwrap();
        assert!(leds.take().iter().all(|&(_, duty)| duty == 0));
        assert!(rgbs.take().iter().all(|&(_, duty)| duty == 0));
    }
}
