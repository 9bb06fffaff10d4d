// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Smartbottle link daemon.
//!
//! Connects to the bottle over BlueZ and prints every engine update as a
//! JSON line on stdout.

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use smartbottle_link::bluetooth::bluez::BluezRadio;
use smartbottle_link::collaborators::{
    Collaborators, DeviceRegistry, LogCompanion, LogReminders, NoHealthMirror, ReminderScheduler,
    ReminderUrgency,
};
use smartbottle_link::config::Config;
use smartbottle_link::engine::{event_channel, Engine};
use smartbottle_link::storage::{DrinkHistory, KnownDevice};
use smartbottle_link::EngineUpdate;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first, it carries the default log filter
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("Starting smartbottle-link v{}...", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", config.data_dir);

    // Initialize storage
    let history = DrinkHistory::new(&config.data_dir)?;
    let registry = KnownDevice::load(&config.data_dir);
    let last_known = registry.last_known();

    if config.health.enabled {
        warn!("Health mirroring is enabled but no health platform is available here");
    }

    let (event_tx, event_rx) = event_channel();
    let radio = BluezRadio::new(event_tx.clone()).await?;

    let collaborators = Collaborators {
        storage: Box::new(history),
        health: Box::new(NoHealthMirror),
        companion: Box::new(LogCompanion),
        registry: Box::new(registry),
    };
    let (engine, handle) = Engine::new(
        Box::new(radio),
        collaborators,
        config.engine_settings(),
        event_tx,
        event_rx,
    );
    let engine_task = tokio::spawn(engine.run());

    // Print updates and schedule reminders after each sync
    let mut updates = handle.subscribe();
    let state = handle.state();
    let printer = tokio::spawn(async move {
        let mut reminders = LogReminders;
        loop {
            let update = match updates.recv().await {
                Ok(update) => update,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Output fell behind, {} updates dropped", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match serde_json::to_string(&update) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Cannot serialize update: {}", e),
            }

            if let EngineUpdate::SyncCompleted { .. } = update {
                if let Some(snapshot) = state.hydration_snapshot() {
                    let deficit = snapshot.deficit_ml();
                    if let Some(urgency) =
                        ReminderUrgency::for_deficit(deficit, snapshot.daily_goal_ml)
                    {
                        reminders.schedule_reminder(urgency, deficit);
                    }
                }
            }
        }
    });

    match last_known {
        Some(device) => {
            info!("Reconnecting to last known bottle {}", device);
            handle.connect(device).await?;
        }
        None => {
            info!("No known bottle, scanning");
            handle.start_scan().await?;
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    handle.shutdown().await?;
    if let Err(e) = engine_task.await {
        error!("Engine task failed: {}", e);
    }
    printer.abort();

    info!("Smartbottle link stopped");
    Ok(())
}
