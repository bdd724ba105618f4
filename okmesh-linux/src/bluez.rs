//! Dual-role BLE radio over BlueZ. The central half (scan for the mesh service, connect,
//! write without response, subscribe) runs on btleplug. btleplug has no GATT server, so
//! the peripheral half (advertising, the mesh characteristic, notifications) runs on bluer.
//!
//! BlueZ sends one characteristic notification to every subscribed central, so this radio
//! reports `notify_reaches_all`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic as LocalCharacteristic, CharacteristicNotifier,
    CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicWrite,
    CharacteristicWriteMethod, Service,
};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::{BleEvent, BleRadio, RadioError};

const LOCAL_NAME: &str = "okmesh";

fn radio_err(e: btleplug::Error) -> RadioError {
    match e {
        btleplug::Error::PermissionDenied => RadioError::PermissionDenied,
        other => RadioError::Backend(other.to_string()),
    }
}

fn bluer_err(e: bluer::Error) -> RadioError {
    match e.kind {
        bluer::ErrorKind::NotPermitted | bluer::ErrorKind::NotAuthorized => {
            RadioError::PermissionDenied
        }
        _ => RadioError::Backend(e.to_string()),
    }
}

struct Link {
    peripheral: Peripheral,
    characteristic: Option<Characteristic>,
    notifications: Option<JoinHandle<()>>,
}

impl Link {
    fn release(self) -> Peripheral {
        if let Some(task) = self.notifications {
            task.abort();
        }
        self.peripheral
    }
}

type Links = Arc<Mutex<HashMap<String, Link>>>;

/// Centrals attached to our GATT server, and the notify session BlueZ opened for them.
#[derive(Default)]
struct Subscribers {
    centrals: BTreeSet<String>,
    notifier: Option<CharacteristicNotifier>,
}

/// Peripheral role; dropping the handles withdraws the advertisement and the service.
struct Advertiser {
    _session: bluer::Session,
    _advertisement: AdvertisementHandle,
    _application: ApplicationHandle,
    subscribers: Arc<Mutex<Subscribers>>,
}

struct Running {
    adapter: Adapter,
    service: Uuid,
    characteristic: Uuid,
    links: Links,
    events: mpsc::UnboundedSender<BleEvent>,
    subscribers: Arc<Mutex<Subscribers>>,
    pump: JoinHandle<()>,
    _advertiser: Advertiser,
}

#[derive(Default)]
pub struct BluezRadio {
    running: Mutex<Option<Running>>,
}

/// What link operations need from the running radio, cloned so slow GATT calls do not
/// hold the radio lock.
struct Handle {
    service: Uuid,
    characteristic: Uuid,
    links: Links,
    events: mpsc::UnboundedSender<BleEvent>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl BluezRadio {
    pub fn new() -> Self {
        Self::default()
    }

    async fn handle(&self) -> Result<Handle, RadioError> {
        let guard = self.running.lock().await;
        let r = guard
            .as_ref()
            .ok_or_else(|| RadioError::Unavailable("radio stopped".to_string()))?;
        Ok(Handle {
            service: r.service,
            characteristic: r.characteristic,
            links: r.links.clone(),
            events: r.events.clone(),
            subscribers: r.subscribers.clone(),
        })
    }
}

/// Advertise the mesh service and serve its characteristic: writes from remote centrals
/// become `WriteReceived`, and the first write from an address announces it as a subscriber.
async fn advertise(
    service: Uuid,
    characteristic: Uuid,
    events: mpsc::UnboundedSender<BleEvent>,
) -> Result<Advertiser, RadioError> {
    let session = bluer::Session::new().await.map_err(bluer_err)?;
    let adapter = session.default_adapter().await.map_err(bluer_err)?;
    adapter.set_powered(true).await.map_err(bluer_err)?;
    let subscribers = Arc::new(Mutex::new(Subscribers::default()));

    let on_write = subscribers.clone();
    let on_notify = subscribers.clone();
    let app = Application {
        services: vec![Service {
            uuid: service,
            primary: true,
            characteristics: vec![LocalCharacteristic {
                uuid: characteristic,
                write: Some(CharacteristicWrite {
                    write: true,
                    write_without_response: true,
                    method: CharacteristicWriteMethod::Fun(Box::new(move |value, req| {
                        let subscribers = on_write.clone();
                        let events = events.clone();
                        async move {
                            let address = req.device_address.to_string();
                            if subscribers.lock().await.centrals.insert(address.clone()) {
                                let _ = events.send(BleEvent::SubscriberConnected {
                                    address: address.clone(),
                                });
                            }
                            let _ = events.send(BleEvent::WriteReceived { address, value });
                            Ok(())
                        }
                        .boxed()
                    })),
                    ..Default::default()
                }),
                notify: Some(CharacteristicNotify {
                    notify: true,
                    method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                        let subscribers = on_notify.clone();
                        async move {
                            debug!("ble notify session opened");
                            subscribers.lock().await.notifier = Some(notifier);
                        }
                        .boxed()
                    })),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };
    let application = adapter
        .serve_gatt_application(app)
        .await
        .map_err(bluer_err)?;
    let advertisement = adapter
        .advertise(Advertisement {
            service_uuids: [service].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(LOCAL_NAME.to_string()),
            ..Default::default()
        })
        .await
        .map_err(bluer_err)?;
    info!(adapter = %adapter.name(), "bluez peripheral advertising");
    Ok(Advertiser {
        _session: session,
        _advertisement: advertisement,
        _application: application,
        subscribers,
    })
}

async fn address_of(adapter: &Adapter, id: &PeripheralId) -> Option<(String, Peripheral)> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    Some((peripheral.address().to_string(), peripheral))
}

async fn pump_events(
    adapter: Adapter,
    service: Uuid,
    links: Links,
    subscribers: Arc<Mutex<Subscribers>>,
    tx: mpsc::UnboundedSender<BleEvent>,
) {
    let mut events = match adapter.events().await {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "bluetooth event stream unavailable");
            return;
        }
    };
    while let Some(event) = events.next().await {
        let out = match event {
            CentralEvent::ServicesAdvertisement { id, services } if services.contains(&service) => {
                let Some((address, peripheral)) = address_of(&adapter, &id).await else {
                    continue;
                };
                links.lock().await.entry(address.clone()).or_insert(Link {
                    peripheral,
                    characteristic: None,
                    notifications: None,
                });
                vec![BleEvent::Discovered { address }]
            }
            CentralEvent::DeviceDisconnected(id) => {
                let Some((address, _)) = address_of(&adapter, &id).await else {
                    continue;
                };
                let mut out = Vec::new();
                if let Some(link) = links.lock().await.remove(&address) {
                    link.release();
                    out.push(BleEvent::CentralDisconnected {
                        address: address.clone(),
                    });
                }
                if subscribers.lock().await.centrals.remove(&address) {
                    out.push(BleEvent::SubscriberDisconnected { address });
                }
                out
            }
            _ => continue,
        };
        for event in out {
            if tx.send(event).is_err() {
                return;
            }
        }
    }
}

/// Discover the mesh characteristic on a connected peripheral and subscribe to it.
async fn open_link(
    peripheral: &Peripheral,
    address: &str,
    h: &Handle,
) -> Result<JoinHandle<()>, RadioError> {
    peripheral.discover_services().await.map_err(radio_err)?;
    let characteristic = peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == h.characteristic && c.service_uuid == h.service)
        .ok_or_else(|| RadioError::Backend(format!("{address} lacks the mesh characteristic")))?;
    peripheral
        .subscribe(&characteristic)
        .await
        .map_err(radio_err)?;
    let mut stream = peripheral.notifications().await.map_err(radio_err)?;

    let tx = h.events.clone();
    let uuid = characteristic.uuid;
    let addr = address.to_string();
    let notifications = tokio::spawn(async move {
        while let Some(n) = stream.next().await {
            if n.uuid != uuid {
                continue;
            }
            let event = BleEvent::NotificationReceived {
                address: addr.clone(),
                value: n.value,
            };
            if tx.send(event).is_err() {
                return;
            }
        }
    });
    if let Some(link) = h.links.lock().await.get_mut(address) {
        link.characteristic = Some(characteristic);
        if let Some(old) = link.notifications.replace(notifications) {
            old.abort();
        }
        return Ok(());
    }
    notifications.abort();
    Err(RadioError::NotConnected(address.to_string()))
}

#[async_trait]
impl BleRadio for BluezRadio {
    async fn start(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<BleEvent>, RadioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let advertiser = advertise(service, characteristic, tx.clone()).await?;

        let manager = Manager::new().await.map_err(radio_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(radio_err)?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Unavailable("no bluetooth adapter".to_string()))?;
        adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(radio_err)?;

        let links = Arc::new(Mutex::new(HashMap::new()));
        let subscribers = advertiser.subscribers.clone();
        let pump = tokio::spawn(pump_events(
            adapter.clone(),
            service,
            links.clone(),
            subscribers.clone(),
            tx.clone(),
        ));
        info!("bluez central scanning");
        *self.running.lock().await = Some(Running {
            adapter,
            service,
            characteristic,
            links,
            events: tx,
            subscribers,
            pump,
            _advertiser: advertiser,
        });
        Ok(rx)
    }

    async fn connect(&self, address: &str) -> Result<(), RadioError> {
        let h = self.handle().await?;
        let peripheral = h
            .links
            .lock()
            .await
            .get(address)
            .map(|l| l.peripheral.clone())
            .ok_or_else(|| RadioError::NotConnected(address.to_string()))?;

        if let Err(e) = peripheral.connect().await {
            h.links.lock().await.remove(address);
            return Err(radio_err(e));
        }
        if let Err(e) = open_link(&peripheral, address, &h).await {
            if let Err(d) = peripheral.disconnect().await {
                debug!(%address, error = %d, "bluez disconnect after failed setup");
            }
            if let Some(link) = h.links.lock().await.remove(address) {
                link.release();
            }
            return Err(e);
        }
        debug!(%address, "bluez link ready");
        let _ = h.events.send(BleEvent::CentralConnected {
            address: address.to_string(),
        });
        Ok(())
    }

    async fn write(&self, address: &str, chunk: &[u8]) -> Result<(), RadioError> {
        let h = self.handle().await?;
        let (peripheral, characteristic) = {
            let links = h.links.lock().await;
            let link = links
                .get(address)
                .ok_or_else(|| RadioError::NotConnected(address.to_string()))?;
            let characteristic = link
                .characteristic
                .clone()
                .ok_or_else(|| RadioError::NotConnected(address.to_string()))?;
            (link.peripheral.clone(), characteristic)
        };
        peripheral
            .write(&characteristic, chunk, WriteType::WithoutResponse)
            .await
            .map_err(radio_err)
    }

    async fn notify(&self, address: &str, chunk: &[u8]) -> Result<(), RadioError> {
        let h = self.handle().await?;
        let mut subscribers = h.subscribers.lock().await;
        let Some(notifier) = subscribers.notifier.as_mut() else {
            return Err(RadioError::NotConnected(address.to_string()));
        };
        if let Err(e) = notifier.notify(chunk.to_vec()).await {
            subscribers.notifier = None;
            return Err(bluer_err(e));
        }
        Ok(())
    }

    fn notify_reaches_all(&self) -> bool {
        true
    }

    async fn disconnect(&self, address: &str) {
        let Ok(h) = self.handle().await else { return };
        let link = h.links.lock().await.remove(address);
        if let Some(link) = link {
            if let Err(e) = link.release().disconnect().await {
                debug!(%address, error = %e, "bluez disconnect failed");
            }
        }
    }

    async fn stop(&self) {
        let Some(r) = self.running.lock().await.take() else { return };
        r.pump.abort();
        let _ = r.adapter.stop_scan().await;
        let links = std::mem::take(&mut *r.links.lock().await);
        for (_, link) in links {
            let connected = link.characteristic.is_some();
            let peripheral = link.release();
            if connected {
                let _ = peripheral.disconnect().await;
            }
        }
        info!("bluez radio stopped");
    }
}
