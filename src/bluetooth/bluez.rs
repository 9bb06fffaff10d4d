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

//! BlueZ-backed radio.
//!
//! Every operation runs on a spawned task and reports back through the engine
//! queue. Writes and reads go through one queue per link so only one GATT
//! operation is outstanding at a time.

use anyhow::{anyhow, Result};
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session,
};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::SERVICE_UUID;
use super::radio::{CharacteristicKind, DeviceId, Radio, ScanFilter};
use crate::events::{EngineEvent, LinkEvent};

const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

type CharacteristicMap = Arc<Mutex<HashMap<CharacteristicKind, Characteristic>>>;

enum GattOp {
    Write(CharacteristicKind, Vec<u8>),
    Read(CharacteristicKind),
}

/// An open link and the tasks serving it.
struct Link {
    id: DeviceId,
    device: Device,
    characteristics: CharacteristicMap,
    ops: mpsc::UnboundedSender<GattOp>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Central-role radio on the default BlueZ adapter.
pub struct BluezRadio {
    _session: Session,
    adapter: Adapter,
    events: mpsc::Sender<EngineEvent>,
    scan: Option<JoinHandle<()>>,
    background: Option<JoinHandle<()>>,
    link: Option<Link>,
}

impl BluezRadio {
    pub async fn new(events: mpsc::Sender<EngineEvent>) -> Result<Self> {
        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            _session: session,
            adapter,
            events,
            scan: None,
            background: None,
            link: None,
        })
    }

    fn parse_address(device: &DeviceId) -> Result<Address> {
        device
            .as_str()
            .parse::<Address>()
            .map_err(|_| anyhow!("invalid bottle address {}", device))
    }

    fn spawn_link_task(&mut self, task: JoinHandle<()>) {
        match self.link.as_mut() {
            Some(link) => link.tasks.push(task),
            None => task.abort(),
        }
    }
}

async fn emit(events: &mpsc::Sender<EngineEvent>, event: LinkEvent) -> bool {
    events.send(EngineEvent::Link(event)).await.is_ok()
}

/// Run discovery and report every device `accept` lets through.
/// Stops after the first report when `once` is set.
async fn discover_loop(
    adapter: Adapter,
    events: mpsc::Sender<EngineEvent>,
    accept: impl Fn(&Address, Option<&str>, &[Uuid]) -> bool,
    once: bool,
) -> Result<()> {
    adapter
        .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
        })
        .await?;

    let discovery = adapter.discover_devices().await?;
    futures::pin_mut!(discovery);

    while let Some(event) = discovery.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let device = adapter.device(address)?;
        let name = device.name().await.ok().flatten();
        let services: Vec<Uuid> = device
            .uuids()
            .await
            .ok()
            .flatten()
            .map(|uuids| uuids.into_iter().collect())
            .unwrap_or_default();

        if !accept(&address, name.as_deref(), &services) {
            continue;
        }

        let rssi = device.rssi().await.ok().flatten();
        debug!("Advertisement from {} ({:?}, rssi {:?})", address, name, rssi);
        let advertisement = LinkEvent::Advertisement {
            device: DeviceId::new(address.to_string()),
            name,
            rssi,
        };
        if !emit(&events, advertisement).await || once {
            break;
        }
    }
    Ok(())
}

/// Connect, then watch the device until it drops off.
async fn connect_and_watch(id: DeviceId, device: Device, events: mpsc::Sender<EngineEvent>) {
    if let Err(e) = device.connect().await {
        emit(
            &events,
            LinkEvent::ConnectFailed {
                device: id,
                error: e.to_string(),
            },
        )
        .await;
        return;
    }

    let watch = match device.events().await {
        Ok(watch) => watch,
        Err(e) => {
            error!("Cannot watch {}: {}", id, e);
            emit(
                &events,
                LinkEvent::ConnectFailed {
                    device: id,
                    error: e.to_string(),
                },
            )
            .await;
            return;
        }
    };
    futures::pin_mut!(watch);

    if !emit(&events, LinkEvent::Connected { device: id.clone() }).await {
        return;
    }

    while let Some(event) = watch.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            emit(
                &events,
                LinkEvent::Disconnected {
                    device: id,
                    reason: "link lost".to_string(),
                },
            )
            .await;
            return;
        }
    }
}

/// Locate the bottle characteristics and subscribe to the notifying ones,
/// then forward notifications until the link goes away.
async fn discover_and_forward(
    id: DeviceId,
    device: Device,
    characteristics: CharacteristicMap,
    events: mpsc::Sender<EngineEvent>,
) {
    let mut subscriptions = Vec::new();
    let found = match locate(&device, &characteristics, &mut subscriptions).await {
        Ok(found) => found,
        Err(e) => {
            emit(
                &events,
                LinkEvent::DiscoveryFailed {
                    device: id,
                    error: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let discovered = LinkEvent::Discovered {
        device: id.clone(),
        characteristics: found,
    };
    if !emit(&events, discovered).await {
        return;
    }

    let mut notifications = stream::select_all(subscriptions);
    while let Some((kind, value)) = notifications.next().await {
        if !emit(&events, LinkEvent::ValueUpdated { kind, value }).await {
            return;
        }
    }
    debug!("Notification streams from {} ended", id);
}

type Notifications = Pin<Box<dyn Stream<Item = (CharacteristicKind, Vec<u8>)> + Send>>;

async fn locate(
    device: &Device,
    characteristics: &CharacteristicMap,
    subscriptions: &mut Vec<Notifications>,
) -> Result<Vec<CharacteristicKind>> {
    while !device.is_services_resolved().await? {
        tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
    }

    let mut found = Vec::new();
    for service in device.services().await? {
        if service.uuid().await? != SERVICE_UUID {
            continue;
        }
        for characteristic in service.characteristics().await? {
            let Some(kind) = CharacteristicKind::from_uuid(characteristic.uuid().await?) else {
                continue;
            };

            if kind.notifies() {
                match characteristic.notify().await {
                    Ok(values) => {
                        subscriptions.push(Box::pin(values.map(move |value| (kind, value))));
                    }
                    Err(e) => {
                        // Reported as missing.
                        warn!("Subscribing to {:?} failed: {}", kind, e);
                        continue;
                    }
                }
            }

            debug!("Found {:?}", kind);
            characteristics.lock().insert(kind, characteristic);
            found.push(kind);
        }
    }
    Ok(found)
}

/// Serve reads and writes one at a time in queue order.
async fn serve_gatt_ops(
    characteristics: CharacteristicMap,
    mut ops: mpsc::UnboundedReceiver<GattOp>,
    events: mpsc::Sender<EngineEvent>,
) {
    while let Some(op) = ops.recv().await {
        let kind = match &op {
            GattOp::Write(kind, _) | GattOp::Read(kind) => *kind,
        };
        let cached = characteristics.lock().get(&kind).cloned();
        let Some(characteristic) = cached else {
            emit(
                &events,
                LinkEvent::WriteFailed {
                    kind,
                    error: "characteristic not discovered".to_string(),
                },
            )
            .await;
            continue;
        };

        let event = match op {
            GattOp::Write(_, data) => match characteristic.write(&data).await {
                Ok(()) => continue,
                Err(e) => LinkEvent::WriteFailed {
                    kind,
                    error: e.to_string(),
                },
            },
            GattOp::Read(_) => match characteristic.read().await {
                Ok(value) => LinkEvent::ValueUpdated { kind, value },
                Err(e) => {
                    warn!("Reading {:?} failed: {}", kind, e);
                    continue;
                }
            },
        };
        if !emit(&events, event).await {
            return;
        }
    }
}

impl Radio for BluezRadio {
    fn start_scan(&mut self, filter: &ScanFilter) -> Result<()> {
        self.stop_scan();

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let filter = filter.clone();
        self.scan = Some(tokio::spawn(async move {
            let discovery = discover_loop(
                adapter,
                events,
                |_: &Address, name: Option<&str>, services: &[Uuid]| filter.matches(name, services),
                false,
            );
            if let Err(e) = discovery.await {
                warn!("Discovery stopped: {}", e);
            }
        }));
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            scan.abort();
        }
    }

    fn is_scanning(&self) -> bool {
        self.scan
            .as_ref()
            .map(|scan| !scan.is_finished())
            .unwrap_or(false)
    }

    fn connect(&mut self, device: &DeviceId) -> Result<()> {
        let address = Self::parse_address(device)?;
        let handle = self.adapter.device(address)?;

        if let Some(mut old) = self.link.take() {
            old.abort();
        }
        if let Some(background) = self.background.take() {
            background.abort();
        }

        let characteristics: CharacteristicMap = Arc::default();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(connect_and_watch(
                device.clone(),
                handle.clone(),
                self.events.clone(),
            )),
            tokio::spawn(serve_gatt_ops(
                characteristics.clone(),
                ops_rx,
                self.events.clone(),
            )),
        ];

        self.link = Some(Link {
            id: device.clone(),
            device: handle,
            characteristics,
            ops: ops_tx,
            tasks,
        });
        Ok(())
    }

    fn discover(&mut self, device: &DeviceId) -> Result<()> {
        let link = self
            .link
            .as_ref()
            .filter(|link| link.id == *device)
            .ok_or_else(|| anyhow!("no link to {}", device))?;

        let task = tokio::spawn(discover_and_forward(
            device.clone(),
            link.device.clone(),
            link.characteristics.clone(),
            self.events.clone(),
        ));
        self.spawn_link_task(task);
        Ok(())
    }

    fn write(&mut self, kind: CharacteristicKind, data: Vec<u8>) -> Result<()> {
        let link = self.link.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        link.ops
            .send(GattOp::Write(kind, data))
            .map_err(|_| anyhow!("link to {} is closing", link.id))
    }

    fn read(&mut self, kind: CharacteristicKind) -> Result<()> {
        let link = self.link.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        link.ops
            .send(GattOp::Read(kind))
            .map_err(|_| anyhow!("link to {} is closing", link.id))
    }

    fn disconnect(&mut self, device: &DeviceId) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        if link.id != *device {
            debug!("Disconnect for {} while linked to {}", device, link.id);
        }
        link.abort();

        let handle = link.device;
        let id = link.id;
        tokio::spawn(async move {
            if let Err(e) = handle.disconnect().await {
                debug!("Disconnecting {}: {}", id, e);
            }
        });
    }

    fn request_background_reconnect(&mut self, device: &DeviceId) -> Result<()> {
        let target = Self::parse_address(device)?;
        if let Some(background) = self.background.take() {
            background.abort();
        }

        info!("Waiting in the background for {}", device);
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        self.background = Some(tokio::spawn(async move {
            let watch = discover_loop(
                adapter,
                events,
                move |address: &Address, _: Option<&str>, _: &[Uuid]| *address == target,
                true,
            );
            if let Err(e) = watch.await {
                warn!("Background reconnect watch stopped: {}", e);
            }
        }));
        Ok(())
    }
}

impl Drop for BluezRadio {
    fn drop(&mut self) {
        self.stop_scan();
        if let Some(background) = self.background.take() {
            background.abort();
        }
        if let Some(mut link) = self.link.take() {
            link.abort();
        }
    }
}
