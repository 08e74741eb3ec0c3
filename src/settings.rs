//! # Light Settings Model
//!
//! ## Why This Module Exists
//! Holds the authoritative in-memory picture of what every fixture in the
//! room is supposed to do right now: nine white LED shelves (racks A/B/C,
//! three shelves each) and three RGB fixtures (one per rack). The broker
//! session writes into this model, the hardware driver only reads from it.
//!
//! ## Key Abstractions
//! - **ShelfId / RackId**: strongly typed fixture addresses. Shelf 3 of each
//!   rack shares its physical slot with that rack's RGB unit, which is the
//!   source of every mutual-exclusion rule in the broker module.
//! - **SettingsStore**: plain setters with transition logging. The store does
//!   not enforce the sharing rules itself; the session's command handlers do,
//!   so that retained-state replay can accumulate conflicting values first
//!   and reconcile them in one pass.
//!
//! Two stores exist during startup: a snapshot store that absorbs retained
//! broker state, and the live store shared with the driver loop. After
//! conflict resolution the snapshot is adopted wholesale into the live store.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

/// Canonical textual form of the "off" RGB color. Matches what the web UI
/// publishes, including the space before the alpha value.
pub const RGB_DEFAULT_TEXT: &str = "RGBA(0,0,0, 255)";

/// Errors turning broker payload text into typed fixture values.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("Unknown rack tag: {0}")]
    UnknownRack(String),

    #[error("Unknown shelf id: {0}")]
    UnknownShelf(String),

    #[error("Unparsable color text: {0}")]
    BadColor(String),
}

/// One of the three light racks in the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RackId {
    A,
    B,
    C,
}

impl RackId {
    pub const ALL: [RackId; 3] = [RackId::A, RackId::B, RackId::C];

    pub fn index(self) -> usize {
        match self {
            RackId::A => 0,
            RackId::B => 1,
            RackId::C => 2,
        }
    }

    /// The shelf whose physical slot is taken over by this rack's RGB unit.
    pub fn shared_shelf(self) -> ShelfId {
        ShelfId {
            rack: self,
            position: Position::P3,
        }
    }
}

impl fmt::Display for RackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            RackId::A => 'A',
            RackId::B => 'B',
            RackId::C => 'C',
        };
        write!(f, "{}", tag)
    }
}

impl FromStr for RackId {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(RackId::A),
            "B" => Ok(RackId::B),
            "C" => Ok(RackId::C),
            other => Err(ValueError::UnknownRack(other.to_string())),
        }
    }
}

/// Vertical shelf position within a rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    P1,
    P2,
    P3,
}

impl Position {
    pub fn number(self) -> u8 {
        match self {
            Position::P1 => 1,
            Position::P2 => 2,
            Position::P3 => 3,
        }
    }
}

/// Address of a single white LED shelf, e.g. `A1` or `C3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShelfId {
    pub rack: RackId,
    pub position: Position,
}

impl ShelfId {
    pub fn all() -> impl Iterator<Item = ShelfId> {
        RackId::ALL.into_iter().flat_map(|rack| {
            [Position::P1, Position::P2, Position::P3]
                .into_iter()
                .map(move |position| ShelfId { rack, position })
        })
    }

    pub fn index(self) -> usize {
        self.rack.index() * 3 + (self.position.number() - 1) as usize
    }

    /// True for the third shelf of each rack, which doubles as the slot of
    /// the rack's RGB fixture.
    pub fn is_shared_slot(self) -> bool {
        self.position == Position::P3
    }
}

impl fmt::Display for ShelfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.rack, self.position.number())
    }
}

impl FromStr for ShelfId {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let (Some(rack_tag), Some(pos), None) = (chars.next(), chars.next(), chars.next()) else {
            return Err(ValueError::UnknownShelf(s.to_string()));
        };
        let rack = RackId::from_str(&rack_tag.to_string())
            .map_err(|_| ValueError::UnknownShelf(s.to_string()))?;
        let position = match pos {
            '1' => Position::P1,
            '2' => Position::P2,
            '3' => Position::P3,
            _ => return Err(ValueError::UnknownShelf(s.to_string())),
        };
        Ok(ShelfId { rack, position })
    }
}

/// Raw RGB channel values, 0-255 each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn is_off(self) -> bool {
        self.r == 0 && self.g == 0 && self.b == 0
    }
}

/// A parsed color payload together with the exact text it arrived as.
///
/// The text is kept around because equality short-circuits and republishes
/// compare/emit the textual form, not the decoded channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorValue {
    pub rgb: Rgb,
    pub text: String,
}

impl ColorValue {
    /// Parses `"RGBA(r,g,b,a)"` text. The alpha component is accepted and
    /// ignored; a three-component `RGBA(r,g,b)` is tolerated as well.
    pub fn parse(text: &str) -> Result<Self, ValueError> {
        let inner = text
            .strip_prefix("RGBA(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| ValueError::BadColor(text.to_string()))?;

        let mut channels = inner.split(',').map(|part| part.trim().parse::<u8>());
        let mut next = |_name| {
            channels
                .next()
                .and_then(|parsed| parsed.ok())
                .ok_or_else(|| ValueError::BadColor(text.to_string()))
        };
        let r = next("r")?;
        let g = next("g")?;
        let b = next("b")?;

        Ok(ColorValue {
            rgb: Rgb { r, g, b },
            text: text.to_string(),
        })
    }

    pub fn default_off() -> Self {
        ColorValue {
            rgb: Rgb::default(),
            text: RGB_DEFAULT_TEXT.to_string(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.text == RGB_DEFAULT_TEXT
    }
}

/// Desired state of one white LED shelf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedState {
    /// Manual override; when false the shelf follows the day/night schedule.
    pub manual_override: bool,
    /// Manual brightness percentage, 0-100. Meaningful only under override.
    pub brightness: u8,
}

/// Desired state of one rack's RGB fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbState {
    pub manual_override: bool,
    pub color: Rgb,
    pub color_text: String,
}

impl Default for RgbState {
    fn default() -> Self {
        RgbState {
            manual_override: false,
            color: Rgb::default(),
            color_text: RGB_DEFAULT_TEXT.to_string(),
        }
    }
}

/// Shared mutable model of every fixture's desired state.
///
/// Setters log the previous and new value at debug level so the log is a
/// complete transition history. They check nothing beyond their types; the
/// broker session is responsible for the shelf-3/RGB sharing rules.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    label: &'static str,
    leds: [LedState; 9],
    rgbs: [RgbState; 3],
}

impl SettingsStore {
    pub fn new(label: &'static str) -> Self {
        debug!("[{}] setting initial configuration for LEDs and RGBs", label);
        SettingsStore {
            label,
            leds: [LedState::default(); 9],
            rgbs: std::array::from_fn(|_| RgbState::default()),
        }
    }

    pub fn led(&self, shelf: ShelfId) -> LedState {
        self.leds[shelf.index()]
    }

    pub fn rgb(&self, rack: RackId) -> &RgbState {
        &self.rgbs[rack.index()]
    }

    pub fn set_led_control(&mut self, shelf: ShelfId, on: bool) {
        let before = self.leds[shelf.index()].manual_override;
        self.leds[shelf.index()].manual_override = on;
        debug!(
            "[{}] shelf [{}] control changed from '{}' to '{}'",
            self.label, shelf, before, on
        );
    }

    pub fn set_led_brightness(&mut self, shelf: ShelfId, brightness: u8) {
        let before = self.leds[shelf.index()].brightness;
        self.leds[shelf.index()].brightness = brightness;
        debug!(
            "[{}] shelf [{}] brightness changed from '{}' to '{}'",
            self.label, shelf, before, brightness
        );
    }

    pub fn set_rgb_control(&mut self, rack: RackId, on: bool) {
        let before = self.rgbs[rack.index()].manual_override;
        self.rgbs[rack.index()].manual_override = on;
        debug!(
            "[{}] rack [{}] control changed from '{}' to '{}'",
            self.label, rack, before, on
        );
    }

    pub fn set_rgb_color(&mut self, rack: RackId, color: &ColorValue) {
        let state = &mut self.rgbs[rack.index()];
        let before = state.color;
        state.color = color.rgb;
        state.color_text = color.text.clone();
        debug!(
            "[{}] rack [{}] color changed from '{:?}' to '{:?}'",
            self.label, rack, before, color.rgb
        );
    }

    /// Forced-dark terminal state used at shutdown: every shelf is explicitly
    /// held off (override on, brightness 0, so the schedule cannot relight
    /// it) and every rack released to its scheduled-off default.
    pub fn turn_all_off(&mut self) {
        for shelf in ShelfId::all() {
            self.leds[shelf.index()] = LedState {
                manual_override: true,
                brightness: 0,
            };
        }
        for rack in RackId::ALL {
            self.rgbs[rack.index()].manual_override = false;
        }
        debug!("[{}] all fixtures forced dark", self.label);
    }

    /// Independent deep copy, used for the retained-replay snapshot.
    pub fn snapshot(&self) -> SettingsStore {
        self.clone()
    }

    /// Copies the other store's fixture maps wholesale into this one. This is
    /// the go-live step after retained-state reconciliation.
    pub fn adopt(&mut self, other: &SettingsStore) {
        self.leds = other.leds;
        self.rgbs = other.rgbs.clone();
        debug!("[{}] adopted fixture state from [{}]", self.label, other.label);
    }

    /// Stable loggable representation of the full state, for diagnostics.
    pub fn dump(&self) -> String {
        let leds: Vec<String> = ShelfId::all()
            .map(|shelf| {
                let led = self.led(shelf);
                format!("{}:({},{})", shelf, led.manual_override, led.brightness)
            })
            .collect();
        let rgbs: Vec<String> = RackId::ALL
            .iter()
            .map(|rack| {
                let rgb = self.rgb(*rack);
                format!(
                    "{}:({},{},{},{})",
                    rack, rgb.manual_override, rgb.color.r, rgb.color.g, rgb.color.b
                )
            })
            .collect();
        format!("leds {{{}}} rgbs {{{}}}", leds.join(" "), rgbs.join(" "))
    }

    /// True when the steady-state fixture rules hold: schedule-following
    /// shelves carry no manual brightness, an RGB override owns its rack's
    /// shared slot exclusively, and released RGB fixtures sit on the default
    /// color. `turn_all_off` intentionally steps outside these rules.
    pub fn invariants_hold(&self) -> bool {
        for shelf in ShelfId::all() {
            let led = self.led(shelf);
            if !led.manual_override && led.brightness != 0 {
                return false;
            }
        }
        for rack in RackId::ALL {
            let rgb = self.rgb(rack);
            if rgb.manual_override {
                let shared = self.led(rack.shared_shelf());
                if shared.manual_override || shared.brightness != 0 {
                    return false;
                }
            } else if !rgb.color.is_off() {
                return false;
            }
        }
        true
    }
}
