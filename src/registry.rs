use crate::config::Config;
use crate::device::{lock, notify, ConnectionMode, Device};
use crate::error::{Error, Result};
use crate::family::BoardFamily;
use crate::transport::{DeviceDescriptor, Discovery, HotplugEvent};
use log::{debug, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Callback invoked when a board is seen for the first time.
pub type AddedListener = Arc<dyn Fn(&Arc<Device>) + Send + Sync>;

/// The bootloader reports the serial number in hexadecimal and divided by ten compared to the
/// decimal number the running application reports.
pub fn normalize_bootloader_serial(raw: u32) -> u32 {
    if raw == u32::MAX {
        raw
    } else {
        raw.wrapping_mul(10)
    }
}

/// Parses the hexadecimal serial string of a board running HalfKay into the number the board
/// reports while running its application.
pub fn parse_bootloader_serial(serial: &str) -> Option<u32> {
    let serial = serial.trim();
    let digits = serial
        .strip_prefix("0x")
        .or_else(|| serial.strip_prefix("0X"))
        .unwrap_or(serial);
    u32::from_str_radix(digits, 16).ok().map(normalize_bootloader_serial)
}

/// Board identity decoded from a USB descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Candidate {
    pub family: BoardFamily,
    pub serial_number: u32,
    pub mode: ConnectionMode,
    pub port: Option<String>,
}

fn unsupported(what: String) -> Error {
    Error::UnsupportedDevice(what)
}

impl Candidate {
    /// Decides whether a descriptor belongs to a supported board, and in which mode it runs.
    pub fn identify(descriptor: &DeviceDescriptor, config: &Config) -> Result<Self> {
        if descriptor.vendor_id != config.vendor_id {
            return Err(unsupported(format!("vendor {:04x}", descriptor.vendor_id)));
        }
        let serial = descriptor
            .serial
            .as_deref()
            .map(str::trim)
            .ok_or_else(|| unsupported("device without serial number".to_string()))?;

        let candidate = if descriptor.product_id == config.runtime_product_id {
            let port = descriptor
                .port
                .clone()
                .ok_or_else(|| unsupported("device without serial port".to_string()))?;
            Candidate {
                family: BoardFamily::from_runtime_revision(descriptor.revision)?,
                serial_number: serial
                    .parse()
                    .map_err(|_| unsupported(format!("serial number {:?}", serial)))?,
                mode: ConnectionMode::Normal,
                port: Some(port),
            }
        } else if descriptor.product_id == config.bootloader_product_id {
            let usage = descriptor
                .usage
                .ok_or_else(|| unsupported("bootloader without HID usage".to_string()))?;
            Candidate {
                family: BoardFamily::from_bootloader_usage(usage)?,
                serial_number: parse_bootloader_serial(serial)
                    .ok_or_else(|| unsupported(format!("serial number {:?}", serial)))?,
                mode: ConnectionMode::Flashing,
                port: None,
            }
        } else {
            return Err(unsupported(format!("product {:04x}", descriptor.product_id)));
        };

        if candidate.serial_number == 0 {
            return Err(unsupported("serial number 0".to_string()));
        }
        Ok(candidate)
    }

    fn into_device(self) -> Result<Device> {
        Device::new(self.family, self.serial_number, self.mode, self.port)
    }
}

enum Message<R> {
    Event(HotplugEvent<R>),
    Shutdown,
}

struct Shared {
    devices: Mutex<Vec<Arc<Device>>>,
    listeners: Mutex<Vec<AddedListener>>,
}

impl Shared {
    fn find(&self, serial_number: u32) -> Option<Arc<Device>> {
        lock(&self.devices)
            .iter()
            .find(|device| device.serial_number() == serial_number)
            .cloned()
    }

    /// Applies one hot-plug observation. Runs on the worker thread only, so lookup and insertion
    /// cannot race with each other.
    fn reconcile(&self, candidate: Candidate, arrived: bool) {
        if let Some(device) = self.find(candidate.serial_number) {
            if arrived {
                device.transition(candidate.mode, candidate.port);
            } else if device.mode() == candidate.mode {
                device.transition(ConnectionMode::Disconnected, None);
            } else {
                debug!("Ignoring departure of an identity {} no longer has", device);
            }
            return;
        }
        if !arrived {
            return;
        }

        let device = match candidate.into_device() {
            Ok(device) => Arc::new(device),
            Err(error) => {
                debug!("Ignoring new board: {}", error);
                return;
            }
        };
        lock(&self.devices).push(Arc::clone(&device));
        info!("Found {}", device);

        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            notify("device added", || listener(&device));
        }
    }
}

fn reconcile_events<D: Discovery>(
    discovery: &D,
    shared: &Shared,
    config: &Config,
    receiver: Receiver<Message<D::Device>>,
) {
    for message in receiver {
        let (device, arrived) = match message {
            Message::Event(HotplugEvent::Arrived(device)) => (device, true),
            Message::Event(HotplugEvent::Left(device)) => (device, false),
            Message::Shutdown => break,
        };

        match discovery
            .describe(&device)
            .and_then(|descriptor| Candidate::identify(&descriptor, config))
        {
            Ok(candidate) => shared.reconcile(candidate, arrived),
            Err(error) => debug!("Ignoring hot-plug event: {}", error),
        }
    }
}

/// Keeps track of every board seen since creation. Boards are never removed; one that goes away
/// stays in the registry as disconnected and picks up its new state when it comes back.
pub struct DeviceRegistry<D: Discovery> {
    shared: Arc<Shared>,
    sender: Sender<Message<D::Device>>,
    worker: Option<JoinHandle<()>>,
    watch: Option<D::Watch>,
}

impl<D: Discovery> DeviceRegistry<D> {
    /// Lists the attached boards and starts following hot-plug events.
    pub fn new(discovery: D, config: Config) -> Result<Self> {
        let discovery = Arc::new(discovery);

        let mut devices: Vec<Arc<Device>> = Vec::new();
        for descriptor in discovery.list_attached(config.vendor_id)? {
            let device = match Candidate::identify(&descriptor, &config)
                .and_then(Candidate::into_device)
            {
                Ok(device) => device,
                Err(error) => {
                    debug!("Skipping {:?}: {}", descriptor, error);
                    continue;
                }
            };
            if devices
                .iter()
                .any(|known| known.serial_number() == device.serial_number())
            {
                continue;
            }
            info!("Found {}", device);
            devices.push(Arc::new(device));
        }

        let shared = Arc::new(Shared {
            devices: Mutex::new(devices),
            listeners: Mutex::new(Vec::new()),
        });

        let (sender, receiver) = mpsc::channel();
        let worker = {
            let discovery = Arc::clone(&discovery);
            let shared = Arc::clone(&shared);
            let config = config.clone();
            thread::Builder::new()
                .name("halfkay-hotplug".to_string())
                .spawn(move || reconcile_events(&*discovery, &shared, &config, receiver))?
        };

        // Dropping the registry on error shuts the worker down again
        let mut registry = DeviceRegistry {
            shared,
            sender,
            worker: Some(worker),
            watch: None,
        };

        let events = Mutex::new(registry.sender.clone());
        registry.watch = Some(discovery.subscribe(
            config.vendor_id,
            Box::new(move |event| {
                // The worker only goes away together with the registry
                let _ = lock(&events).send(Message::Event(event));
            }),
        )?);

        Ok(registry)
    }

    /// Calls `visit` for every known board until it returns `false` or panics. A panic ends the
    /// walk and is not propagated. Works on a snapshot, so `visit` may call back into the
    /// registry.
    pub fn enumerate<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<Device>) -> bool,
    {
        for device in self.devices() {
            match panic::catch_unwind(AssertUnwindSafe(|| visit(&device))) {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => {
                    warn!("An enumerate callback panicked");
                    break;
                }
            }
        }
    }

    /// First board matching both filters, if any. `None` matches everything.
    pub fn find(
        &self,
        serial_number: Option<u32>,
        mode: Option<ConnectionMode>,
    ) -> Option<Arc<Device>> {
        lock(&self.shared.devices)
            .iter()
            .find(|device| {
                serial_number.map_or(true, |serial| device.serial_number() == serial)
                    && mode.map_or(true, |mode| device.mode() == mode)
            })
            .cloned()
    }

    /// Selects the board to work with among the connected ones. Without a serial number this only
    /// succeeds if exactly one board is connected.
    pub fn pick(&self, serial_number: Option<u32>) -> Result<Arc<Device>> {
        let mut connected: Vec<_> = self
            .devices()
            .into_iter()
            .filter(|device| device.mode() != ConnectionMode::Disconnected)
            .collect();

        if let Some(serial) = serial_number {
            connected
                .into_iter()
                .find(|device| device.serial_number() == serial)
                .ok_or(Error::TargetNotFound)
        } else if connected.len() > 1 {
            Err(Error::TooManyMatches)
        } else {
            connected.pop().ok_or(Error::TargetNotFound)
        }
    }

    /// Snapshot of all known boards in discovery order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        lock(&self.shared.devices).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a callback for boards discovered after creation. It runs on the registry's
    /// worker thread.
    pub fn on_device_added<F>(&self, listener: F)
    where
        F: Fn(&Arc<Device>) + Send + Sync + 'static,
    {
        lock(&self.shared.listeners).push(Arc::new(listener));
    }
}

impl<D: Discovery> Drop for DeviceRegistry<D> {
    fn drop(&mut self) {
        // Stop the event source before the worker
        self.watch.take();
        let _ = self.sender.send(Message::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Hot-plug worker panicked");
            }
        }
    }
}
