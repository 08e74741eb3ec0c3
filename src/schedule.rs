//! # Day/Night Schedule
//!
//! Pure wall-clock brightness curve for shelves without a manual override.
//! The day cycles through night → sunrise ramp → day → sunset ramp, with
//! both ramps rising/falling linearly over a configurable number of minutes.
//! The phase function takes the time of day as an argument so tests can probe
//! exact boundaries without a real clock.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Unparsable clock time (expected H:MM): {0}")]
    BadClockTime(String),
}

/// Clock times and ramp length for the light schedule.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Sunrise as `H:MM`, e.g. `"7:00"`.
    pub sunrise: String,
    /// Sunset as `H:MM`, e.g. `"19:00"`. Must be later than sunrise.
    pub sunset: String,
    /// How long each rise/set ramp lasts, in minutes.
    pub ramp_minutes: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            sunrise: "7:00".to_string(),
            sunset: "19:00".to_string(),
            ramp_minutes: 30,
        }
    }
}

/// Phase of the day as seen by the lights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayPhase {
    Night,
    SunriseRamp,
    Day,
    SunsetRamp,
}

impl DayPhase {
    /// RGB fixtures are blacked out while the white LEDs ramp, regardless of
    /// any manual override.
    pub fn is_ramp(self) -> bool {
        matches!(self, DayPhase::SunriseRamp | DayPhase::SunsetRamp)
    }
}

/// The compiled schedule: sunrise/sunset as minutes since midnight.
#[derive(Debug, Clone)]
pub struct SunSchedule {
    sunrise: i32,
    sunset: i32,
    ramp: i32,
}

impl SunSchedule {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ScheduleError> {
        Ok(SunSchedule {
            sunrise: parse_clock_minutes(&config.sunrise)?,
            sunset: parse_clock_minutes(&config.sunset)?,
            ramp: config.ramp_minutes as i32,
        })
    }

    /// Brightness fraction for the given time of day, recomputed fresh on
    /// every call. Decision order matters: the ramp windows take precedence
    /// over the coarse night/day split.
    pub fn phase_at(&self, now: NaiveTime) -> (DayPhase, f64) {
        let since_sunrise = self.minutes_since(now, self.sunrise);
        let since_sunset = self.minutes_since(now, self.sunset);

        if since_sunrise >= 0 && since_sunrise < self.ramp {
            // Whole elapsed minutes plus the current second, so the fraction
            // moves within a minute instead of stepping at minute boundaries.
            let elapsed = (since_sunrise * 60 + now.second() as i32) as f64;
            return (DayPhase::SunriseRamp, elapsed / (self.ramp * 60) as f64);
        }

        if since_sunset >= 0 && since_sunset < self.ramp {
            let elapsed = (since_sunset * 60 + now.second() as i32) as f64;
            return (DayPhase::SunsetRamp, 1.0 - elapsed / (self.ramp * 60) as f64);
        }

        if since_sunrise <= 0 || since_sunset >= self.ramp {
            return (DayPhase::Night, 0.0);
        }

        (DayPhase::Day, 1.0)
    }

    /// Not modulo-normalized: negative before the mark, positive after.
    fn minutes_since(&self, now: NaiveTime, mark: i32) -> i32 {
        (now.hour() * 60 + now.minute()) as i32 - mark
    }
}

/// Quantizes a brightness fraction to an integer duty value on the given
/// scale (the PCA9685 tops out at 4095).
pub fn duty(fraction: f64, scale: u16) -> u16 {
    (fraction.clamp(0.0, 1.0) * scale as f64).round() as u16
}

fn parse_clock_minutes(text: &str) -> Result<i32, ScheduleError> {
    let (hours, minutes) = text
        .split_once(':')
        .ok_or_else(|| ScheduleError::BadClockTime(text.to_string()))?;
    let hours: i32 = hours
        .trim()
        .parse()
        .map_err(|_| ScheduleError::BadClockTime(text.to_string()))?;
    let minutes: i32 = minutes
        .trim()
        .parse()
        .map_err(|_| ScheduleError::BadClockTime(text.to_string()))?;
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(ScheduleError::BadClockTime(text.to_string()));
    }
    Ok(hours * 60 + minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> SunSchedule {
        SunSchedule::from_config(&ScheduleConfig::default()).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn sunrise_boundaries() {
        let sun = schedule();

        let (phase, fraction) = sun.phase_at(at(6, 59, 59));
        assert_eq!(phase, DayPhase::Night);
        assert_eq!(fraction, 0.0);

        let (phase, fraction) = sun.phase_at(at(7, 0, 0));
        assert_eq!(phase, DayPhase::SunriseRamp);
        assert_eq!(fraction, 0.0);

        let (phase, fraction) = sun.phase_at(at(7, 15, 0));
        assert_eq!(phase, DayPhase::SunriseRamp);
        assert!((fraction - 0.5).abs() < 1e-9);

        // Ramp window is half-open: at sunrise + ramp the day has begun.
        let (phase, fraction) = sun.phase_at(at(7, 30, 0));
        assert_eq!(phase, DayPhase::Day);
        assert_eq!(fraction, 1.0);
    }

    #[test]
    fn fraction_moves_within_a_minute() {
        let sun = schedule();
        let (_, early) = sun.phase_at(at(7, 10, 0));
        let (_, late) = sun.phase_at(at(7, 10, 30));
        assert!(late > early);
    }

    #[test]
    fn sunset_mirrors_sunrise() {
        let sun = schedule();

        let (phase, fraction) = sun.phase_at(at(19, 0, 0));
        assert_eq!(phase, DayPhase::SunsetRamp);
        assert_eq!(fraction, 1.0);

        let (phase, fraction) = sun.phase_at(at(19, 15, 0));
        assert_eq!(phase, DayPhase::SunsetRamp);
        assert!((fraction - 0.5).abs() < 1e-9);

        let (phase, fraction) = sun.phase_at(at(19, 30, 0));
        assert_eq!(phase, DayPhase::Night);
        assert_eq!(fraction, 0.0);
    }

    #[test]
    fn night_wraps_across_midnight() {
        let sun = schedule();
        for time in [at(0, 0, 0), at(3, 0, 0), at(23, 59, 59), at(6, 0, 0)] {
            let (phase, fraction) = sun.phase_at(time);
            assert_eq!(phase, DayPhase::Night, "expected night at {}", time);
            assert_eq!(fraction, 0.0);
        }
    }

    #[test]
    fn midday_is_full_day() {
        let sun = schedule();
        let (phase, fraction) = sun.phase_at(at(12, 0, 0));
        assert_eq!(phase, DayPhase::Day);
        assert_eq!(fraction, 1.0);
    }

    #[test]
    fn duty_rounds_against_scale() {
        assert_eq!(duty(0.0, 4095), 0);
        assert_eq!(duty(1.0, 4095), 4095);
        assert_eq!(duty(0.5, 4095), 2048);
        // Out-of-range fractions are clamped rather than wrapped.
        assert_eq!(duty(1.5, 4095), 4095);
        assert_eq!(duty(-0.1, 4095), 0);
    }

    #[test]
    fn clock_times_validate() {
        assert!(SunSchedule::from_config(&ScheduleConfig {
            sunrise: "25:00".into(),
            ..ScheduleConfig::default()
        })
        .is_err());
        assert!(SunSchedule::from_config(&ScheduleConfig {
            sunset: "19".into(),
            ..ScheduleConfig::default()
        })
        .is_err());
        assert!(SunSchedule::from_config(&ScheduleConfig {
            sunrise: "6:61".into(),
            ..ScheduleConfig::default()
        })
        .is_err());
    }
}
