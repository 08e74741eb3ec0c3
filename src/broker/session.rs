//! Broker session state machine.
//!
//! A session walks through three stages, encoded as statum states so a stage
//! cannot be skipped: **Ignore** (created, not yet established), **Retained**
//! (subscribed, replaying retained broker state into a private snapshot) and
//! **Listening** (live command handling against the shared store). The
//! command semantics live in pure planner functions that mutate a store and
//! return the publishes to perform, which keeps them testable without a
//! broker and keeps the hardware-sharing rules in one place.

use std::sync::Arc;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, Publish};
use statum::{machine, state};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, error, info, trace};

use super::backoff::Backoff;
use super::command::{Command, Outbound, Plan, Publisher};
use super::debounce::ColorDebouncer;
use crate::alerts::Alerts;
use crate::config::{BrokerConfig, TimingConfig};
use crate::settings::{ColorValue, RackId, SettingsStore, ShelfId};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection with broker timed out")]
    ConnectTimeout,

    #[error("Broker refused the connection: {0}")]
    Refused(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Client request channel failure: {0}")]
    Client(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionStage {
    Ignore,
    Retained,
    Listening,
}

#[machine]
pub struct Session<S: SessionStage> {
    publisher: Publisher,
    eventloop: rumqttc::EventLoop,
    live: Arc<RwLock<SettingsStore>>,
    snapshot: SettingsStore,
    debouncer: ColorDebouncer,
    alerts: Alerts,
    backoff: Backoff,
    timing: TimingConfig,
}

impl Session<Ignore> {
    /// Builds a session around a fresh client. Nothing touches the network
    /// until [`connect`](Self::connect) starts polling the event loop.
    pub fn open(
        broker: &BrokerConfig,
        timing: TimingConfig,
        live: Arc<RwLock<SettingsStore>>,
        alerts: Alerts,
        backoff: Backoff,
    ) -> Self {
        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options
            .set_credentials(&broker.username, &broker.password)
            .set_keep_alive(Duration::from_secs(5));
        let (client, eventloop) = AsyncClient::new(options, 100);

        let publisher = Publisher::new(
            client,
            broker.topic_root(),
            timing.anti_timeout(),
            timing.anti_interference(),
        );
        let debouncer = ColorDebouncer::new(timing.color_debounce(), live.clone(), publisher.clone());

        info!(
            "Initialized a connection with broker '{}' with username '{}'",
            broker.host, broker.username
        );

        Self::new(
            publisher,
            eventloop,
            live,
            SettingsStore::new("snapshot"),
            debouncer,
            alerts,
            backoff,
            timing,
        )
    }

    /// Polls the transport until the broker acknowledges the connection or
    /// the connect deadline passes. Success resets the reconnect backoff and
    /// subscribes to the full topic tree; any failure escalates the backoff.
    pub async fn connect(mut self) -> Result<Session<Retained>, SessionError> {
        info!("Attempting to connect to MQTT broker");
        let deadline = Instant::now() + self.timing.connect_timeout();

        loop {
            let event = match timeout_at(deadline, self.eventloop.poll()).await {
                Err(_) => {
                    error!("Connection with broker timed out, aborting connection");
                    self.connect_failed("Connection with MQTT broker timed out");
                    return Err(SessionError::ConnectTimeout);
                }
                Ok(Err(e)) => {
                    error!("Transport error while connecting: {}", e);
                    self.connect_failed(&format!("Could NOT connect to MQTT broker: {}", e));
                    return Err(SessionError::Transport(e.to_string()));
                }
                Ok(Ok(event)) => event,
            };

            match event {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("Connection is established with the MQTT broker");
                        self.backoff.reset();
                        self.alerts.info("Connected to MQTT broker successfully");

                        info!("Subscribing to root topic '{}#'", self.publisher.root());
                        self.publisher
                            .subscribe_root()
                            .await
                            .map_err(|e| SessionError::Client(e.to_string()))?;

                        debug!("Switching stage to RETAINED");
                        return Ok(self.transition());
                    }
                    error!("Bad connection, return code: {:?}", ack.code);
                    let code = format!("{:?}", ack.code);
                    self.connect_failed(&format!("MQTT broker refused connection: {}", code));
                    return Err(SessionError::Refused(code));
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    // Nothing should arrive before the ConnAck; drop it.
                    info!(
                        "Ignoring TOPIC [{}] MESSAGE [{}]",
                        publish.topic,
                        String::from_utf8_lossy(&publish.payload)
                    );
                }
                other => trace!("Connect-stage event: {:?}", other),
            }
        }
    }

    fn connect_failed(&self, alert: &str) {
        self.backoff.escalate();
        self.alerts.critical(alert);
    }
}

impl Session<Retained> {
    /// Replays retained broker state into the snapshot, reconciles it, and
    /// goes live: wait out the retained settle window, run conflict
    /// resolution, wait a second shorter window so our own corrections echo
    /// back harmlessly, then copy the snapshot wholesale into the live store.
    pub async fn synchronize(mut self) -> Result<Session<Listening>, SessionError> {
        self.drain_window(self.timing.retained_settle(), Absorb::Snapshot)
            .await?;
        info!("Retrieved all retained messages");
        debug!("Snapshot settings: {}", self.snapshot.dump());

        info!("Fixing conflicting retained settings");
        let plan = fix_conflicts(&mut self.snapshot);
        self.publisher.send_plan(&plan).await;

        self.drain_window(self.timing.post_fix_settle(), Absorb::Drop)
            .await?;
        debug!("Final snapshot settings: {}", self.snapshot.dump());

        {
            let mut live = self.live.write().await;
            live.adopt(&self.snapshot);
            info!("Cloned snapshot settings into live settings");
            debug!("Live settings: {}", live.dump());
        }

        debug!("Switching stage to LISTENING");
        Ok(self.transition())
    }

    async fn drain_window(
        &mut self,
        window: Duration,
        absorb: Absorb,
    ) -> Result<(), SessionError> {
        let deadline = Instant::now() + window;
        loop {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Err(_) => return Ok(()),
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => match absorb {
                    Absorb::Snapshot => self.absorb(publish),
                    Absorb::Drop => info!(
                        "Ignoring TOPIC [{}] MESSAGE [{}]",
                        publish.topic,
                        String::from_utf8_lossy(&publish.payload)
                    ),
                },
                Ok(Ok(other)) => trace!("Replay-stage event: {:?}", other),
                Ok(Err(e)) => {
                    error!("Connection lost during retained replay: {}", e);
                    self.backoff.escalate();
                    self.alerts
                        .critical(format!("Disconnected from the MQTT broker: {}", e));
                    return Err(SessionError::Transport(e.to_string()));
                }
            }
        }
    }

    /// Applies a retained message to the snapshot through the raw setters.
    /// No sharing rules are enforced here; conflicting retained state is
    /// expected and reconciled afterwards in one pass.
    fn absorb(&mut self, publish: Publish) {
        info!(
            "Retained TOPIC [{}] MESSAGE [{}]",
            publish.topic,
            String::from_utf8_lossy(&publish.payload)
        );
        match Command::parse(self.publisher.root(), &publish.topic, &publish.payload) {
            Ok(Command::LedControl(shelf, on)) => self.snapshot.set_led_control(shelf, on),
            Ok(Command::LedBrightness(shelf, value)) => {
                self.snapshot.set_led_brightness(shelf, value)
            }
            Ok(Command::RgbControl(rack, on)) => self.snapshot.set_rgb_control(rack, on),
            Ok(Command::RgbColor(rack, color)) => self.snapshot.set_rgb_color(rack, &color),
            Ok(Command::LedReset(_) | Command::RgbReset(_)) => {
                debug!("Reset requests carry no retained state, skipping")
            }
            Err(e) => error!("Unable to parse the incoming message: {}", e),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Absorb {
    Snapshot,
    Drop,
}

impl Session<Listening> {
    /// Terminal operating stage: route live commands until the transport
    /// drops. Returns the disconnect cause; reconnecting is the supervisor's
    /// decision, driven by the shared backoff value.
    pub async fn listen(mut self) -> SessionError {
        info!("Listening for live commands");
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => self.dispatch(publish).await,
                Ok(other) => trace!("Listening-stage event: {:?}", other),
                Err(e) => {
                    error!(
                        "Connection with broker lost at {}: {}",
                        chrono::Local::now().format("%m-%d-%y %H:%M:%S"),
                        e
                    );
                    self.backoff.escalate();
                    self.alerts
                        .critical(format!("Disconnected from the MQTT broker: {}", e));
                    return SessionError::Transport(e.to_string());
                }
            }
        }
    }

    /// One live message. Parse failures are logged and dropped; nothing a
    /// client publishes may take the subscriber loop down.
    async fn dispatch(&mut self, publish: Publish) {
        info!(
            "Listening TOPIC [{}] MESSAGE [{}]",
            publish.topic,
            String::from_utf8_lossy(&publish.payload)
        );
        match Command::parse(self.publisher.root(), &publish.topic, &publish.payload) {
            Ok(Command::RgbColor(rack, color)) => {
                info!("Incoming request RGB color for rack '{}'", rack);
                self.debouncer.submit(rack, color).await;
            }
            Ok(command) => {
                let plan = {
                    let mut store = self.live.write().await;
                    live_plan(&mut store, &command)
                };
                self.publisher.send_plan(&plan).await;
            }
            Err(e) => error!("Unable to parse the incoming message: {}", e),
        }
    }
}

/// One-time reconciliation of replayed retained state, run against the
/// snapshot before it goes live. Guarantees the hardware-sharing rules hold:
/// an RGB override owns its rack's shared slot, a released RGB fixture sits
/// on the default color, and schedule-following shelves carry no manual
/// brightness. Idempotent: a second run finds nothing to correct.
pub fn fix_conflicts(store: &mut SettingsStore) -> Plan {
    let mut plan = Plan::default();

    for rack in RackId::ALL {
        if store.rgb(rack).manual_override {
            let shelf = rack.shared_shelf();
            if store.led(shelf).manual_override {
                plan.push(Outbound::LedControl(shelf, false));
                store.set_led_control(shelf, false);
            }
            if store.led(shelf).brightness != 0 {
                plan.push(Outbound::LedBrightness(shelf, 0));
                store.set_led_brightness(shelf, 0);
            }
        } else if !store.rgb(rack).color.is_off() {
            plan.push(Outbound::rgb_default(rack));
            store.set_rgb_color(rack, &ColorValue::default_off());
        }
    }

    for shelf in ShelfId::all() {
        let led = store.led(shelf);
        if !led.manual_override && led.brightness != 0 {
            plan.push(Outbound::LedBrightness(shelf, 0));
            store.set_led_brightness(shelf, 0);
        }
    }

    info!("Finished fixing conflicting settings");
    plan
}

/// Live command semantics: the incremental mirror of [`fix_conflicts`],
/// enforcing the same rules one command at a time. Corrections are published
/// retained; their echo re-enters the normal dispatch path, which is also how
/// the publish-only reset commands take effect.
pub fn live_plan(store: &mut SettingsStore, command: &Command) -> Plan {
    match command {
        Command::LedReset(shelf) => {
            info!("Incoming request LED reset for shelf '{}'", shelf);
            Plan {
                outbound: vec![
                    Outbound::LedControl(*shelf, false),
                    Outbound::LedBrightness(*shelf, 0),
                ],
                interference: false,
            }
        }

        Command::LedControl(shelf, true) => {
            info!("Incoming request LED control shelf '{}' control 'true'", shelf);
            if shelf.is_shared_slot() && store.rgb(shelf.rack).manual_override {
                info!(
                    "Illegal request to control shelf '{}', rack '{}' has RGB override",
                    shelf, shelf.rack
                );
                return Plan::rejection(Outbound::LedControl(*shelf, false));
            }
            store.set_led_control(*shelf, true);
            Plan::default()
        }

        Command::LedControl(shelf, false) => {
            info!("Incoming request LED control shelf '{}' control 'false'", shelf);
            let mut plan = Plan::default();
            if store.led(*shelf).brightness != 0 {
                store.set_led_brightness(*shelf, 0);
                plan.push(Outbound::LedBrightness(*shelf, 0));
            }
            store.set_led_control(*shelf, false);
            plan
        }

        Command::LedBrightness(shelf, value) => {
            info!(
                "Incoming request LED brightness shelf '{}' brightness '{}'",
                shelf, value
            );
            if !store.led(*shelf).manual_override && *value != 0 {
                info!(
                    "Illegal request to change brightness for shelf '{}' without override",
                    shelf
                );
                return Plan::rejection(Outbound::LedBrightness(*shelf, 0));
            }
            store.set_led_brightness(*shelf, *value);
            Plan::default()
        }

        Command::RgbReset(rack) => {
            info!("Incoming request RGB reset for rack '{}'", rack);
            Plan {
                outbound: vec![Outbound::RgbControl(*rack, false), Outbound::rgb_default(*rack)],
                interference: false,
            }
        }

        Command::RgbControl(rack, on) => {
            info!("Incoming request RGB control for rack '{}' control '{}'", rack, on);
            let mut plan = Plan::default();
            if *on {
                let shelf = rack.shared_shelf();
                if store.led(shelf).manual_override {
                    info!("Resetting shared shelf '{}' to hand the slot to the RGB unit", shelf);
                    plan.push(Outbound::LedControl(shelf, false));
                    plan.push(Outbound::LedBrightness(shelf, 0));
                }
            } else if !store.rgb(*rack).color.is_off() {
                plan.push(Outbound::rgb_default(*rack));
            }
            store.set_rgb_control(*rack, *on);
            plan
        }

        // Colors go through the debouncer, never through this planner.
        Command::RgbColor(..) => Plan::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::debounce::commit_color;
    use crate::settings::RGB_DEFAULT_TEXT;

    fn shelf(id: &str) -> ShelfId {
        id.parse().unwrap()
    }

    fn color(text: &str) -> ColorValue {
        ColorValue::parse(text).unwrap()
    }

    /// Feeds a plan's publishes back into the handlers the way the broker
    /// would echo them to our own subscription, until the state settles.
    fn settle(store: &mut SettingsStore, mut plan: Plan) {
        for _ in 0..10 {
            if plan.is_empty() {
                return;
            }
            let echoes: Vec<Outbound> = std::mem::take(&mut plan.outbound);
            for echo in echoes {
                let followup = match echo {
                    Outbound::LedControl(s, on) => {
                        live_plan(store, &Command::LedControl(s, on))
                    }
                    Outbound::LedBrightness(s, v) => {
                        live_plan(store, &Command::LedBrightness(s, v))
                    }
                    Outbound::RgbControl(r, on) => live_plan(store, &Command::RgbControl(r, on)),
                    Outbound::RgbColor(r, text) => commit_color(store, r, &color(&text)),
                };
                plan.outbound.extend(followup.outbound);
            }
        }
        panic!("correction echoes did not settle");
    }

    fn lcg(seed: &mut u64) -> u64 {
        *seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        *seed >> 33
    }

    /// An arbitrary retained-state snapshot, conflicts and all.
    fn random_snapshot(seed: &mut u64) -> SettingsStore {
        let mut store = SettingsStore::new("snapshot");
        for s in ShelfId::all() {
            store.set_led_control(s, lcg(seed) % 2 == 0);
            store.set_led_brightness(s, (lcg(seed) % 101) as u8);
        }
        for rack in RackId::ALL {
            store.set_rgb_control(rack, lcg(seed) % 2 == 0);
            if lcg(seed) % 2 == 0 {
                let text = format!(
                    "RGBA({},{},{}, 255)",
                    lcg(seed) % 256,
                    lcg(seed) % 256,
                    lcg(seed) % 256
                );
                store.set_rgb_color(rack, &color(&text));
            }
        }
        store
    }

    #[test]
    fn fix_conflicts_enforces_the_sharing_rules() {
        let mut store = SettingsStore::new("snapshot");
        // Rack A: RGB override and the shared shelf both claim the slot.
        store.set_rgb_control(RackId::A, true);
        store.set_led_control(shelf("A3"), true);
        store.set_led_brightness(shelf("A3"), 40);
        // Rack B: released RGB left with a stale color.
        store.set_rgb_color(RackId::B, &color("RGBA(10,20,30, 255)"));
        // Shelf C1: stale brightness without an override.
        store.set_led_brightness(shelf("C1"), 30);

        let plan = fix_conflicts(&mut store);

        assert!(store.invariants_hold());
        assert!(!plan.interference);
        assert!(plan.outbound.contains(&Outbound::LedControl(shelf("A3"), false)));
        assert!(plan.outbound.contains(&Outbound::LedBrightness(shelf("A3"), 0)));
        assert!(plan.outbound.contains(&Outbound::rgb_default(RackId::B)));
        assert!(plan.outbound.contains(&Outbound::LedBrightness(shelf("C1"), 0)));
    }

    #[test]
    fn fix_conflicts_is_idempotent() {
        let mut seed = 7;
        for _ in 0..50 {
            let mut store = random_snapshot(&mut seed);
            fix_conflicts(&mut store);
            let fixed = store.clone();

            let second = fix_conflicts(&mut store);
            assert!(second.is_empty());
            assert_eq!(store.dump(), fixed.dump());
        }
    }

    #[test]
    fn fixed_snapshots_always_satisfy_the_invariants() {
        let mut seed = 42;
        for _ in 0..200 {
            let mut store = random_snapshot(&mut seed);
            fix_conflicts(&mut store);
            assert!(store.invariants_hold(), "violated for: {}", store.dump());
        }
    }

    #[test]
    fn shared_slot_control_is_rejected_while_rgb_owns_it() {
        let mut store = SettingsStore::new("live");
        store.set_rgb_control(RackId::A, true);

        let plan = live_plan(&mut store, &Command::LedControl(shelf("A3"), true));
        assert!(plan.interference);
        assert_eq!(plan.outbound, vec![Outbound::LedControl(shelf("A3"), false)]);
        assert!(!store.led(shelf("A3")).manual_override);

        // A non-shared shelf of the same rack is accepted unconditionally.
        let plan = live_plan(&mut store, &Command::LedControl(shelf("A1"), true));
        assert!(plan.is_empty());
        assert!(store.led(shelf("A1")).manual_override);
    }

    #[test]
    fn turning_a_shelf_off_clears_its_brightness_first() {
        let mut store = SettingsStore::new("live");
        store.set_led_control(shelf("B2"), true);
        store.set_led_brightness(shelf("B2"), 60);

        let plan = live_plan(&mut store, &Command::LedControl(shelf("B2"), false));
        assert_eq!(plan.outbound, vec![Outbound::LedBrightness(shelf("B2"), 0)]);
        assert!(!plan.interference);
        let led = store.led(shelf("B2"));
        assert!(!led.manual_override);
        assert_eq!(led.brightness, 0);
    }

    #[test]
    fn brightness_without_override_is_rejected() {
        let mut store = SettingsStore::new("live");

        let plan = live_plan(&mut store, &Command::LedBrightness(shelf("C2"), 75));
        assert!(plan.interference);
        assert_eq!(plan.outbound, vec![Outbound::LedBrightness(shelf("C2"), 0)]);
        assert_eq!(store.led(shelf("C2")).brightness, 0);

        // Brightness 0 is fine without an override, and anything goes with one.
        assert!(live_plan(&mut store, &Command::LedBrightness(shelf("C2"), 0)).is_empty());
        store.set_led_control(shelf("C2"), true);
        assert!(live_plan(&mut store, &Command::LedBrightness(shelf("C2"), 75)).is_empty());
        assert_eq!(store.led(shelf("C2")).brightness, 75);
    }

    #[test]
    fn rgb_control_on_resets_the_shared_shelf_by_publish() {
        let mut store = SettingsStore::new("live");
        store.set_led_control(shelf("B3"), true);
        store.set_led_brightness(shelf("B3"), 50);

        let plan = live_plan(&mut store, &Command::RgbControl(RackId::B, true));
        assert_eq!(
            plan.outbound,
            vec![
                Outbound::LedControl(shelf("B3"), false),
                Outbound::LedBrightness(shelf("B3"), 0),
            ]
        );
        // The control flag applies immediately; the shared shelf is released
        // when the corrective publishes echo back.
        assert!(store.rgb(RackId::B).manual_override);
        assert!(store.led(shelf("B3")).manual_override);

        settle(&mut store, plan);
        assert!(store.invariants_hold());
        assert!(!store.led(shelf("B3")).manual_override);
        assert_eq!(store.led(shelf("B3")).brightness, 0);
    }

    #[test]
    fn rgb_control_off_restores_the_default_color() {
        let mut store = SettingsStore::new("live");
        store.set_rgb_control(RackId::C, true);
        store.set_rgb_color(RackId::C, &color("RGBA(40,50,60, 255)"));

        let plan = live_plan(&mut store, &Command::RgbControl(RackId::C, false));
        assert_eq!(plan.outbound, vec![Outbound::rgb_default(RackId::C)]);
        assert!(!store.rgb(RackId::C).manual_override);

        settle(&mut store, plan);
        assert!(store.invariants_hold());
        assert_eq!(store.rgb(RackId::C).color_text, RGB_DEFAULT_TEXT);
    }

    #[test]
    fn resets_only_publish() {
        let mut store = SettingsStore::new("live");
        store.set_led_control(shelf("A2"), true);
        store.set_led_brightness(shelf("A2"), 90);

        let plan = live_plan(&mut store, &Command::LedReset(shelf("A2")));
        assert_eq!(
            plan.outbound,
            vec![
                Outbound::LedControl(shelf("A2"), false),
                Outbound::LedBrightness(shelf("A2"), 0),
            ]
        );
        // Untouched until the echoes come back.
        assert!(store.led(shelf("A2")).manual_override);

        settle(&mut store, plan);
        assert!(!store.led(shelf("A2")).manual_override);
        assert_eq!(store.led(shelf("A2")).brightness, 0);

        let plan = live_plan(&mut store, &Command::RgbReset(RackId::A));
        assert_eq!(
            plan.outbound,
            vec![
                Outbound::RgbControl(RackId::A, false),
                Outbound::rgb_default(RackId::A),
            ]
        );
    }

    #[test]
    fn random_command_sequences_preserve_the_invariants_once_settled() {
        let mut seed = 2026;
        let mut store = SettingsStore::new("live");
        fix_conflicts(&mut store);

        for _ in 0..500 {
            let rack = RackId::ALL[(lcg(&mut seed) % 3) as usize];
            let target = format!("{}{}", rack, lcg(&mut seed) % 3 + 1);
            let command = match lcg(&mut seed) % 6 {
                0 => Command::LedControl(shelf(&target), lcg(&mut seed) % 2 == 0),
                1 => Command::LedBrightness(shelf(&target), (lcg(&mut seed) % 101) as u8),
                2 => Command::LedReset(shelf(&target)),
                3 => Command::RgbControl(rack, lcg(&mut seed) % 2 == 0),
                4 => Command::RgbReset(rack),
                _ => {
                    let text = format!("RGBA({},0,0, 255)", lcg(&mut seed) % 256);
                    let plan = commit_color(&mut store, rack, &color(&text));
                    settle(&mut store, plan);
                    assert!(store.invariants_hold(), "after color: {}", store.dump());
                    continue;
                }
            };
            let plan = live_plan(&mut store, &command);
            settle(&mut store, plan);
            assert!(
                store.invariants_hold(),
                "after {:?}: {}",
                command,
                store.dump()
            );
        }
    }
}
