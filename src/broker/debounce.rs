//! Per-rack color debouncing.
//!
//! A web UI color slider produces a burst of `rgb/color` messages. Writing
//! each one to hardware and possibly answering each with a corrective publish
//! would flood the broker, so rapid updates are coalesced: the first message
//! starts a worker, later ones only replace the pending value, and after a
//! fixed window the worker commits whatever value it last saw. The handoff
//! between the dispatch path and the worker goes through a `watch` channel,
//! never an unsynchronized shared variable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use super::command::{Outbound, Plan, Publisher};
use crate::settings::{ColorValue, RackId, SettingsStore};

#[derive(Debug, Clone)]
pub struct ColorDebouncer {
    window: Duration,
    live: Arc<RwLock<SettingsStore>>,
    publisher: Publisher,
    /// Latest-value channel per rack with an active worker. An entry exists
    /// exactly while its worker is sampling.
    active: Arc<Mutex<HashMap<RackId, watch::Sender<ColorValue>>>>,
}

impl ColorDebouncer {
    pub fn new(window: Duration, live: Arc<RwLock<SettingsStore>>, publisher: Publisher) -> Self {
        ColorDebouncer {
            window,
            live,
            publisher,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Records `color` as the rack's pending value and makes sure a worker
    /// will commit it. At most one worker runs per rack; while one is active,
    /// later submissions only replace the pending value.
    pub async fn submit(&self, rack: RackId, color: ColorValue) {
        {
            let store = self.live.read().await;
            if store.rgb(rack).color_text == color.text {
                info!("Rack {} is already {}", rack, color.text);
                return;
            }
        }

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pending) = active.get(&rack) {
            if pending.send(color.clone()).is_ok() {
                debug!("Rack {} color worker already running, updated pending value", rack);
                return;
            }
            // The worker finished between our map lookup and the send.
            active.remove(&rack);
        }

        debug!("Starting color worker for rack {}", rack);
        let (tx, rx) = watch::channel(color);
        active.insert(rack, tx);
        drop(active);

        let worker = self.clone();
        tokio::spawn(async move {
            worker.run_worker(rack, rx).await;
        });
    }

    /// Sleeps out the sampling window, then commits the final observed value
    /// exactly once. Deregisters before reading the channel, so a submission
    /// racing the end of the window either lands in this commit or starts a
    /// fresh worker; it is never lost.
    async fn run_worker(&self, rack: RackId, rx: watch::Receiver<ColorValue>) {
        tokio::time::sleep(self.window).await;

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&rack);
        let color = rx.borrow().clone();
        info!("Color worker for rack {} ended, final color {}", rack, color.text);

        let plan = {
            let mut store = self.live.write().await;
            commit_color(&mut store, rack, &color)
        };
        self.publisher.send_plan(&plan).await;
    }
}

/// The conflict-checked color handler the worker commits through. A color on
/// a rack whose override is off is interference: the request is discarded
/// and the default color is restored locally and on the broker.
pub fn commit_color(store: &mut SettingsStore, rack: RackId, color: &ColorValue) -> Plan {
    if !store.rgb(rack).manual_override && !color.is_default() {
        info!(
            "Illegal color request for rack '{}' without override, restoring default",
            rack
        );
        store.set_rgb_color(rack, &ColorValue::default_off());
        return Plan::rejection(Outbound::rgb_default(rack));
    }
    store.set_rgb_color(rack, color);
    Plan::default()
}
