pub mod alerts;
pub mod broker;
pub mod config;
pub mod hardware;
pub mod schedule;
pub mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::alerts::Alerts;
use crate::broker::backoff::Backoff;
use crate::broker::session::{Session, SessionError};
use crate::config::Config;
use crate::hardware::driver::LightDriver;
use crate::hardware::pca9685::Pca9685;
use crate::hardware::DummyChannels;
use crate::schedule::SunSchedule;
use crate::settings::SettingsStore;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = Config::load(std::env::args().nth(1).map(PathBuf::from))?;
    let alerts = Alerts::spawn();
    alerts.info("Raspberry Pi: running fishlight");

    info!("{}", "=".repeat(50));
    info!("Running main script");

    let schedule = SunSchedule::from_config(&config.schedule)?;
    let live = Arc::new(RwLock::new(SettingsStore::new("live")));

    let mut driver = build_driver(&config, schedule, live.clone())?;

    info!("Updating the PWM modules for the first time");
    if let Err(e) = driver.refresh().await {
        error!("Failed to light up the room, check the PWM modules: {}", e);
        alerts.critical("Raspberry Pi: PWM module cannot be opened");
        return Err(eyre!("PWM modules unavailable: {}", e));
    }
    info!("PWM modules updated, electronics working as intended");

    // Driver tick loop; keeps running through failed ticks and performs one
    // final flush after the store has been forced dark at shutdown.
    let cancel = CancellationToken::new();
    let tick = config.timing.driver_tick();
    let driver_cancel = cancel.clone();
    let driver_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = driver_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = driver.refresh().await {
                        error!("Unable to update the PWM modules: {}", e);
                    }
                }
            }
        }
        match driver.refresh().await {
            Ok(()) => info!("Successfully turned off all the lights"),
            Err(e) => error!("Failed to turn off the lights: {}", e),
        }
    });

    // Broker supervision: run sessions back to back, sleeping out the shared
    // backoff between attempts, up to the configured retry ceiling.
    let backoff = Backoff::new(config.timing.reconnect_base());
    let supervisor_live = live.clone();
    let supervisor_alerts = alerts.clone();
    let broker_config = config.broker.clone();
    let timing = config.timing.clone();
    let supervisor = tokio::spawn(async move {
        let mut attempts = 0;
        loop {
            let session = Session::open(
                &broker_config,
                timing.clone(),
                supervisor_live.clone(),
                supervisor_alerts.clone(),
                backoff.clone(),
            );
            let cause: SessionError = match session.connect().await {
                Ok(retained) => match retained.synchronize().await {
                    Ok(listening) => listening.listen().await,
                    Err(e) => e,
                },
                Err(e) => e,
            };
            error!("Broker session ended: {}", cause);

            attempts += 1;
            if attempts >= timing.max_reconnect_attempts {
                error!("Reached the reconnect limit, staying offline");
                supervisor_alerts
                    .critical("Raspberry Pi gave up reconnecting to the MQTT broker");
                break;
            }
            let delay = backoff.current();
            error!("Will reconnect after {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    error!("Script manually terminated");
    supervisor.abort();

    info!("Script ended, shutting down the lights");
    live.write().await.turn_all_off();
    cancel.cancel();
    if driver_handle.await.is_err() {
        error!("Driver task did not shut down cleanly");
    }

    alerts.critical("fishlight script got terminated");
    // Give the alert worker a moment to drain before the runtime drops it.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    Ok(())
}

fn build_driver(
    config: &Config,
    schedule: SunSchedule,
    live: Arc<RwLock<SettingsStore>>,
) -> Result<LightDriver> {
    if config.hardware.dummy {
        info!("Hardware in dummy mode, duty cycles are logged only");
        return Ok(LightDriver::new(
            schedule,
            live,
            Box::new(DummyChannels::new("led")),
            Box::new(DummyChannels::new("rgb")),
        ));
    }

    let led_out = Pca9685::new(
        config.hardware.led_module_address,
        config.hardware.pwm_frequency_hz,
    )
    .map_err(|e| eyre!("Failed to open LED PWM module: {}", e))?;
    let rgb_out = Pca9685::new(
        config.hardware.rgb_module_address,
        config.hardware.pwm_frequency_hz,
    )
    .map_err(|e| eyre!("Failed to open RGB PWM module: {}", e))?;
    info!("Initialized the LED and RGB PWM modules");

    Ok(LightDriver::new(
        schedule,
        live,
        Box::new(led_out),
        Box::new(rgb_out),
    ))
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
