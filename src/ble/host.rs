//! btleplug-backed `PeripheralAccess` for desktop hosts.
//!
//! btleplug is async and high level: it discovers a peer's whole GATT table
//! in one call and addresses attributes by UUID. This adapter maps it onto
//! the handle-based, one-request-at-a-time command set:
//!
//! - Connection handles are allocated here (`u8`, never two live at once).
//! - The GATT table is snapshotted right after connect. Service and
//!   characteristic "discovery" then resolves against the snapshot and
//!   hands out synthetic handles (1-based indices).
//! - Reads, writes and disconnects run on spawned tasks; their outcome comes
//!   back as `PeripheralEvent`s on the channel returned by `open`.
//! - Advertisements are rebuilt into AD structures (flags, local name,
//!   manufacturer data) from the peer's cached properties.
//! - `PeripheralProperties` carries no connectable or scan-response bit, so
//!   every report goes out with `HOST_REPORT_FLAGS`. The triage flag check
//!   only filters on transports that see the raw report type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use btleplug::api::{
    AddressType as HostAddressType, Central, CentralEvent, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::adv_parser::{AD_TYPE_COMPLETE_NAME, AD_TYPE_MANUFACTURER_DATA};
use super::{
    AddressType, BdAddr, ConnectionHandle, PeripheralAccess, PeripheralEvent, ProcedureStatus,
    ReportFlags,
};
use crate::config::{ConnectionParameters, ScanMode, CONNECT_TIMEOUT_SECS};
use crate::error::AccessError;

/// Report flags attached to every advertisement seen through btleplug.
const HOST_REPORT_FLAGS: ReportFlags =
    ReportFlags(ReportFlags::CONNECTABLE.0 | ReportFlags::DISCOVERABLE.0);

impl From<btleplug::Error> for AccessError {
    fn from(err: btleplug::Error) -> Self {
        AccessError::Transport(err.to_string())
    }
}

/// One open link and its GATT snapshot.
struct Link {
    peripheral: Peripheral,
    services: Vec<Service>,
    /// Characteristics handed out so far; handle `n` is index `n - 1`.
    characteristics: Vec<Characteristic>,
}

#[derive(Default)]
struct Links {
    /// Every advertiser seen, for `open_connection`.
    peers: HashMap<BdAddr, Peripheral>,
    open: HashMap<ConnectionHandle, Link>,
    by_id: HashMap<PeripheralId, ConnectionHandle>,
    next_handle: u8,
}

impl Links {
    fn allocate(&mut self) -> Option<ConnectionHandle> {
        for _ in 0..=u8::MAX {
            let handle = ConnectionHandle(self.next_handle);
            self.next_handle = self.next_handle.wrapping_add(1);
            if !self.open.contains_key(&handle) {
                return Some(handle);
            }
        }
        None
    }

    /// Forget a link. Returns its handle only for the first caller, so the
    /// close event is emitted once whichever side notices first.
    fn release(&mut self, id: &PeripheralId) -> Option<ConnectionHandle> {
        let handle = self.by_id.remove(id)?;
        self.open.remove(&handle);
        Some(handle)
    }
}

type Shared = Arc<Mutex<Links>>;

fn lock(links: &Shared) -> Result<MutexGuard<'_, Links>, AccessError> {
    links
        .lock()
        .map_err(|_| AccessError::Transport("link table lock poisoned".into()))
}

pub struct BtleplugAccess {
    adapter: Adapter,
    links: Shared,
    events: UnboundedSender<PeripheralEvent>,
    scan: UnboundedSender<bool>,
}

impl BtleplugAccess {
    /// Open the `index`-th adapter and start pumping its events. `Boot` is
    /// the first event on the returned channel.
    pub async fn open(
        index: usize,
    ) -> Result<(Self, UnboundedReceiver<PeripheralEvent>), AccessError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .get(index)
            .cloned()
            .ok_or_else(|| AccessError::Transport(format!("no Bluetooth adapter #{index}")))?;
        match adapter.adapter_info().await {
            Ok(info) => info!(adapter = %info, "using adapter"),
            Err(err) => warn!(%err, "adapter info unavailable"),
        }

        let (events, rx) = mpsc::unbounded_channel();
        let (scan, scan_rx) = mpsc::unbounded_channel();
        let links = Shared::default();

        let central_events = adapter.events().await?;
        tokio::spawn(pump_adapter_events(
            adapter.clone(),
            central_events,
            links.clone(),
            events.clone(),
        ));
        tokio::spawn(run_scanner(adapter.clone(), scan_rx));

        let _ = events.send(PeripheralEvent::Boot);
        Ok((
            Self {
                adapter,
                links,
                events,
                scan,
            },
            rx,
        ))
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn emit(&self, event: PeripheralEvent) {
        emit(&self.events, event);
    }

    fn complete(&self, handle: ConnectionHandle, status: ProcedureStatus) {
        self.emit(PeripheralEvent::ProcedureCompleted { handle, status });
    }

    fn characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: u16,
    ) -> Result<(Peripheral, Characteristic), AccessError> {
        let links = lock(&self.links)?;
        let link = links
            .open
            .get(&handle)
            .ok_or(AccessError::NotConnected(handle))?;
        let found = usize::from(characteristic)
            .checked_sub(1)
            .and_then(|i| link.characteristics.get(i))
            .cloned()
            .ok_or(AccessError::UnknownAttribute(characteristic))?;
        Ok((link.peripheral.clone(), found))
    }
}

fn emit(events: &UnboundedSender<PeripheralEvent>, event: PeripheralEvent) {
    if events.send(event).is_err() {
        debug!("event receiver gone");
    }
}

impl PeripheralAccess for BtleplugAccess {
    fn set_connection_parameters(
        &mut self,
        params: &ConnectionParameters,
    ) -> Result<(), AccessError> {
        // The host stack owns link parameters; btleplug exposes no knob.
        debug!(?params, "connection parameters left to the host stack");
        Ok(())
    }

    fn start_scanning(&mut self, mode: ScanMode) -> Result<(), AccessError> {
        debug!(?mode, "scan requested");
        self.scan
            .send(true)
            .map_err(|_| AccessError::Transport("scanner task stopped".into()))
    }

    fn stop_scanning(&mut self) -> Result<(), AccessError> {
        self.scan
            .send(false)
            .map_err(|_| AccessError::Transport("scanner task stopped".into()))
    }

    fn open_connection(
        &mut self,
        address: BdAddr,
        address_type: AddressType,
    ) -> Result<(), AccessError> {
        let peripheral = lock(&self.links)?
            .peers
            .get(&address)
            .cloned()
            .ok_or(AccessError::UnknownPeer(address))?;

        let links = self.links.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let limit = Duration::from_secs(CONNECT_TIMEOUT_SECS);
            match bounded(limit, connect_and_snapshot(&peripheral)).await {
                Ok(services) => {
                    let handle = lock(&links).ok().and_then(|mut links| {
                        let handle = links.allocate()?;
                        links.by_id.insert(peripheral.id(), handle);
                        links.open.insert(
                            handle,
                            Link {
                                peripheral: peripheral.clone(),
                                services,
                                characteristics: Vec::new(),
                            },
                        );
                        Some(handle)
                    });
                    match handle {
                        Some(handle) => emit(
                            &events,
                            PeripheralEvent::ConnectionOpened {
                                handle,
                                address,
                                address_type,
                            },
                        ),
                        None => {
                            error!(%address, "no connection handle available");
                            let _ = peripheral.disconnect().await;
                            emit(
                                &events,
                                PeripheralEvent::ConnectionFailed {
                                    address,
                                    reason: ProcedureStatus::UNLIKELY_ERROR,
                                },
                            );
                        }
                    }
                }
                Err((reason, err)) => {
                    warn!(%address, status = %reason, %err, "connect failed");
                    let _ = peripheral.disconnect().await;
                    emit(&events, PeripheralEvent::ConnectionFailed { address, reason });
                }
            }
        });
        Ok(())
    }

    fn discover_services_by_uuid(
        &mut self,
        handle: ConnectionHandle,
        uuid: Uuid,
    ) -> Result<(), AccessError> {
        let found = {
            let links = lock(&self.links)?;
            let link = links
                .open
                .get(&handle)
                .ok_or(AccessError::NotConnected(handle))?;
            link.services
                .iter()
                .position(|s| s.uuid == uuid)
                .map(|i| i as u32 + 1)
        };
        match found {
            Some(service) => self.emit(PeripheralEvent::ServiceDiscovered { handle, service }),
            None => debug!(%handle, %uuid, "service not present"),
        }
        self.complete(handle, ProcedureStatus::SUCCESS);
        Ok(())
    }

    fn discover_characteristics_by_uuid(
        &mut self,
        handle: ConnectionHandle,
        service: u32,
        uuid: Uuid,
    ) -> Result<(), AccessError> {
        let found = {
            let mut links = lock(&self.links)?;
            let link = links
                .open
                .get_mut(&handle)
                .ok_or(AccessError::NotConnected(handle))?;
            let index = (service as usize)
                .checked_sub(1)
                .ok_or(AccessError::UnknownAttribute(service as u16))?;
            let svc = link
                .services
                .get(index)
                .ok_or(AccessError::UnknownAttribute(service as u16))?;
            match svc.characteristics.iter().find(|c| c.uuid == uuid).cloned() {
                Some(c) => {
                    link.characteristics.push(c);
                    Some(link.characteristics.len() as u16)
                }
                None => None,
            }
        };
        match found {
            Some(characteristic) => self.emit(PeripheralEvent::CharacteristicDiscovered {
                handle,
                characteristic,
            }),
            None => debug!(%handle, %uuid, "characteristic not present"),
        }
        self.complete(handle, ProcedureStatus::SUCCESS);
        Ok(())
    }

    fn read_characteristic_value(
        &mut self,
        handle: ConnectionHandle,
        characteristic: u16,
    ) -> Result<(), AccessError> {
        let (peripheral, target) = self.characteristic(handle, characteristic)?;
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = match peripheral.read(&target).await {
                Ok(value) => {
                    emit(
                        &events,
                        PeripheralEvent::CharacteristicValueReceived { handle, value },
                    );
                    ProcedureStatus::SUCCESS
                }
                Err(err) => {
                    warn!(%handle, uuid = %target.uuid, %err, "read failed");
                    ProcedureStatus::UNLIKELY_ERROR
                }
            };
            emit(&events, PeripheralEvent::ProcedureCompleted { handle, status });
        });
        Ok(())
    }

    fn write_characteristic_value(
        &mut self,
        handle: ConnectionHandle,
        characteristic: u16,
        value: &[u8],
    ) -> Result<(), AccessError> {
        let (peripheral, target) = self.characteristic(handle, characteristic)?;
        let events = self.events.clone();
        let value = value.to_vec();
        tokio::spawn(async move {
            let status = match peripheral
                .write(&target, &value, WriteType::WithResponse)
                .await
            {
                Ok(()) => ProcedureStatus::SUCCESS,
                Err(err) => {
                    warn!(%handle, uuid = %target.uuid, %err, "write failed");
                    ProcedureStatus::UNLIKELY_ERROR
                }
            };
            emit(&events, PeripheralEvent::ProcedureCompleted { handle, status });
        });
        Ok(())
    }

    fn close_connection(&mut self, handle: ConnectionHandle) -> Result<(), AccessError> {
        let peripheral = lock(&self.links)?
            .open
            .get(&handle)
            .map(|link| link.peripheral.clone())
            .ok_or(AccessError::NotConnected(handle))?;

        let links = self.links.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(err) = peripheral.disconnect().await {
                warn!(%handle, %err, "disconnect failed");
            }
            let released = lock(&links)
                .ok()
                .and_then(|mut links| links.release(&peripheral.id()));
            if let Some(handle) = released {
                emit(
                    &events,
                    PeripheralEvent::ConnectionClosed {
                        handle,
                        reason: ProcedureStatus::LOCAL_HOST_TERMINATED,
                    },
                );
            }
        });
        Ok(())
    }
}

async fn connect_and_snapshot(peripheral: &Peripheral) -> Result<Vec<Service>, btleplug::Error> {
    if !peripheral.is_connected().await? {
        peripheral.connect().await?;
    }
    peripheral.discover_services().await?;
    Ok(peripheral.services().into_iter().collect())
}

/// Run `attempt` for at most `limit`. A transport error maps to
/// `UNLIKELY_ERROR`, running out of time to `CONNECTION_TIMEOUT`.
async fn bounded<T>(
    limit: Duration,
    attempt: impl Future<Output = Result<T, btleplug::Error>>,
) -> Result<T, (ProcedureStatus, String)> {
    match tokio::time::timeout(limit, attempt).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err((ProcedureStatus::UNLIKELY_ERROR, err.to_string())),
        Err(_) => Err((
            ProcedureStatus::CONNECTION_TIMEOUT,
            format!("no answer within {}s", limit.as_secs_f32()),
        )),
    }
}

/// Apply scanner on/off requests strictly in the order they were issued.
async fn run_scanner(adapter: Adapter, mut requests: UnboundedReceiver<bool>) {
    while let Some(on) = requests.recv().await {
        let result = if on {
            adapter.start_scan(ScanFilter::default()).await
        } else {
            adapter.stop_scan().await
        };
        match result {
            Ok(()) => debug!(on, "scanner updated"),
            Err(err) => error!(on, %err, "scanner command failed"),
        }
    }
}

async fn pump_adapter_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    links: Shared,
    events: UnboundedSender<PeripheralEvent>,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                if let Err(err) = report_advertisement(&adapter, &id, &links, &events).await {
                    trace!(?id, %err, "advertisement skipped");
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let released = lock(&links).ok().and_then(|mut links| links.release(&id));
                if let Some(handle) = released {
                    emit(
                        &events,
                        PeripheralEvent::ConnectionClosed {
                            handle,
                            reason: ProcedureStatus::REMOTE_USER_TERMINATED,
                        },
                    );
                }
            }
            _ => {}
        }
    }
    warn!("adapter event stream ended");
}

async fn report_advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    links: &Shared,
    events: &UnboundedSender<PeripheralEvent>,
) -> Result<(), AccessError> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(props) = peripheral.properties().await? else {
        return Ok(());
    };
    let address = BdAddr(props.address.into_inner());
    let address_type = match props.address_type {
        Some(HostAddressType::Random) => AddressType::RandomStatic,
        _ => AddressType::Public,
    };

    lock(links)?.peers.insert(address, peripheral);
    emit(
        events,
        PeripheralEvent::AdvertisementObserved {
            address,
            address_type,
            flags: HOST_REPORT_FLAGS,
            payload: rebuild_advertisement(&props),
        },
    );
    Ok(())
}

/// Re-encode cached properties as AD structures.
fn rebuild_advertisement(props: &PeripheralProperties) -> Vec<u8> {
    let mut payload = vec![0x02, 0x01, 0x06];
    if let Some(name) = &props.local_name {
        push_ad(&mut payload, AD_TYPE_COMPLETE_NAME, name.as_bytes());
    }
    let mut companies: Vec<_> = props.manufacturer_data.iter().collect();
    companies.sort_by_key(|(id, _)| **id);
    for (company, data) in companies {
        let mut body = company.to_le_bytes().to_vec();
        body.extend_from_slice(data);
        push_ad(&mut payload, AD_TYPE_MANUFACTURER_DATA, &body);
    }
    payload
}

fn push_ad(payload: &mut Vec<u8>, ad_type: u8, body: &[u8]) {
    // AD length is one byte and covers the type byte.
    let body = &body[..body.len().min(usize::from(u8::MAX) - 1)];
    payload.push(body.len() as u8 + 1);
    payload.push(ad_type);
    payload.extend_from_slice(body);
}
