//! Topic/payload parsing and outbound publish records.
//!
//! Incoming MQTT messages are turned into typed [`Command`]s by an explicit
//! parser; the session branches on the parse result, and a malformed message
//! can never mutate the store.
//! Outbound traffic goes the other way: handlers describe what to publish as
//! [`Outbound`] records and the [`Publisher`] turns them into retained
//! publishes with the required pacing.

use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::settings::{ColorValue, RackId, ShelfId, ValueError, RGB_DEFAULT_TEXT};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Topic outside the configured root: {0}")]
    ForeignTopic(String),

    #[error("Topic does not decompose into domain/action/target: {0}")]
    TopicShape(String),

    #[error("Unrecognized domain or action: {0}")]
    UnknownAction(String),

    #[error("Payload is not a boolean ('True'/'False'): {0}")]
    BadBoolean(String),

    #[error("Payload is not a brightness value (0-100): {0}")]
    BadBrightness(String),

    #[error("{0}")]
    BadValue(#[from] ValueError),
}

/// A fully decoded desired-state message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    LedControl(ShelfId, bool),
    LedBrightness(ShelfId, u8),
    LedReset(ShelfId),
    RgbControl(RackId, bool),
    RgbColor(RackId, ColorValue),
    RgbReset(RackId),
}

impl Command {
    /// Decodes `<root><domain>/<action>/<target>` plus payload. The payload
    /// arrives as raw bytes from the broker and is treated as UTF-8 text.
    pub fn parse(root: &str, topic: &str, payload: &[u8]) -> Result<Command, CommandError> {
        let rest = topic
            .strip_prefix(root)
            .ok_or_else(|| CommandError::ForeignTopic(topic.to_string()))?;

        let segments: Vec<&str> = rest.split('/').collect();
        let [domain, action, target] = segments[..] else {
            return Err(CommandError::TopicShape(topic.to_string()));
        };

        let text = String::from_utf8_lossy(payload);
        match (domain, action) {
            ("led", "control") => Ok(Command::LedControl(target.parse()?, parse_bool(&text)?)),
            ("led", "brightness") => {
                Ok(Command::LedBrightness(target.parse()?, parse_brightness(&text)?))
            }
            ("led", "reset") => Ok(Command::LedReset(target.parse()?)),
            ("rgb", "control") => Ok(Command::RgbControl(target.parse()?, parse_bool(&text)?)),
            ("rgb", "color") => Ok(Command::RgbColor(target.parse()?, ColorValue::parse(&text)?)),
            ("rgb", "reset") => Ok(Command::RgbReset(target.parse()?)),
            _ => Err(CommandError::UnknownAction(topic.to_string())),
        }
    }
}

fn parse_bool(text: &str) -> Result<bool, CommandError> {
    match text {
        "True" => Ok(true),
        "False" => Ok(false),
        other => Err(CommandError::BadBoolean(other.to_string())),
    }
}

fn parse_brightness(text: &str) -> Result<u8, CommandError> {
    let value: u8 = text
        .parse()
        .map_err(|_| CommandError::BadBrightness(text.to_string()))?;
    if value > 100 {
        return Err(CommandError::BadBrightness(text.to_string()));
    }
    Ok(value)
}

/// One desired-state value to publish back to the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    LedControl(ShelfId, bool),
    LedBrightness(ShelfId, u8),
    RgbControl(RackId, bool),
    RgbColor(RackId, String),
}

impl Outbound {
    pub fn rgb_default(rack: RackId) -> Outbound {
        Outbound::RgbColor(rack, RGB_DEFAULT_TEXT.to_string())
    }

    pub fn topic(&self, root: &str) -> String {
        match self {
            Outbound::LedControl(shelf, _) => format!("{root}led/control/{shelf}"),
            Outbound::LedBrightness(shelf, _) => format!("{root}led/brightness/{shelf}"),
            Outbound::RgbControl(rack, _) => format!("{root}rgb/control/{rack}"),
            Outbound::RgbColor(rack, _) => format!("{root}rgb/color/{rack}"),
        }
    }

    pub fn payload(&self) -> String {
        match self {
            Outbound::LedControl(_, on) | Outbound::RgbControl(_, on) => {
                if *on { "True" } else { "False" }.to_string()
            }
            Outbound::LedBrightness(_, value) => value.to_string(),
            Outbound::RgbColor(_, text) => text.clone(),
        }
    }
}

/// What a command handler decided to do on the wire.
///
/// `interference` marks plans born from rejecting a conflicting request;
/// those are preceded by the longer anti-interference pause so a stubborn
/// client cannot make the fixture flap.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Plan {
    pub outbound: Vec<Outbound>,
    pub interference: bool,
}

impl Plan {
    pub fn push(&mut self, out: Outbound) {
        self.outbound.push(out);
    }

    pub fn rejection(out: Outbound) -> Plan {
        Plan {
            outbound: vec![out],
            interference: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }
}

/// Retained-publish side of the broker session, shared with the debouncer.
#[derive(Debug, Clone)]
pub struct Publisher {
    client: AsyncClient,
    root: String,
    anti_timeout: Duration,
    anti_interference: Duration,
}

impl Publisher {
    pub fn new(
        client: AsyncClient,
        root: String,
        anti_timeout: Duration,
        anti_interference: Duration,
    ) -> Self {
        Publisher {
            client,
            root,
            anti_timeout,
            anti_interference,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub async fn subscribe_root(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe(format!("{}#", self.root), QoS::AtMostOnce)
            .await
    }

    /// Publishes one desired-state value, retained, followed by the
    /// anti-timeout pause. Publish failures are logged and swallowed; the
    /// session only ends when the event loop itself reports a disconnect.
    pub async fn send(&self, out: &Outbound) {
        let topic = out.topic(&self.root);
        let payload = out.payload();
        trace!("Publishing retained [{}] [{}]", topic, payload);
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, true, payload)
            .await
        {
            error!("Failed to queue publish: {}", e);
        }
        tokio::time::sleep(self.anti_timeout).await;
    }

    pub async fn send_plan(&self, plan: &Plan) {
        if plan.is_empty() {
            return;
        }
        if plan.interference {
            debug!("Correction after a rejected request, pausing before publishing");
            tokio::time::sleep(self.anti_interference).await;
        }
        for out in &plan.outbound {
            self.send(out).await;
        }
    }
}
