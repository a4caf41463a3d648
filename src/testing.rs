//! In-memory stand-ins for the USB stack.

use crate::device::{lock, ConnectionMode, Device};
use crate::error::{Error, Result};
use crate::hex::write_record;
use crate::transport::{
    DeviceDescriptor, Discovery, EventSink, HotplugEvent, ReportWriter, Transport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type Hook = Arc<dyn Fn() + Send + Sync>;

pub(crate) fn runtime_descriptor(revision: u16, serial: &str, port: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: 0x16c0,
        product_id: 0x0483,
        revision,
        usage: None,
        serial: Some(serial.to_string()),
        port: Some(port.to_string()),
    }
}

pub(crate) fn bootloader_descriptor(usage: u16, serial: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: 0x16c0,
        product_id: 0x0478,
        revision: 0x0100,
        usage: Some(usage),
        serial: Some(serial.to_string()),
        port: None,
    }
}

/// Intel HEX record with a correct checksum.
pub(crate) fn hex_record(kind: u8, address: u16, data: &[u8]) -> String {
    let mut out = Vec::new();
    write_record(&mut out, kind, address, data).unwrap();
    String::from_utf8(out).unwrap()
}

/// Polls `condition` for up to two seconds.
pub(crate) fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Records reports and plays a scripted sequence of write failures.
pub(crate) struct FakeTransport {
    report_len: usize,
    reports: Arc<Mutex<Vec<Vec<u8>>>>,
    failures: Arc<Mutex<VecDeque<bool>>>,
    started: Mutex<Vec<String>>,
    refuse_open: AtomicBool,
    on_start: Option<Hook>,
    on_reboot: Option<Hook>,
}

impl FakeTransport {
    pub(crate) fn new(report_len: usize) -> Self {
        FakeTransport {
            report_len,
            reports: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            started: Mutex::new(Vec::new()),
            refuse_open: AtomicBool::new(false),
            on_start: None,
            on_reboot: None,
        }
    }

    /// A transport which switches `device` between its modes directly.
    pub(crate) fn rebooting(device: &Arc<Device>) -> Self {
        let to_bootloader = Arc::clone(device);
        let to_runtime = Arc::clone(device);
        Self::new(device.profile().report_len())
            .on_start(move || {
                to_bootloader.transition(ConnectionMode::Flashing, None);
            })
            .on_reboot(move || {
                to_runtime.transition(ConnectionMode::Normal, Some("001:002".to_string()));
            })
    }

    pub(crate) fn with_report_len(mut self, report_len: usize) -> Self {
        self.report_len = report_len;
        self
    }

    pub(crate) fn on_start<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub(crate) fn on_reboot<F: Fn() + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.on_reboot = Some(Arc::new(hook));
        self
    }

    /// Queues the outcome of the next writes, `true` failing one.
    pub(crate) fn fail_writes(&self, pattern: &[bool]) {
        lock(&self.failures).extend(pattern.iter().copied());
    }

    pub(crate) fn refuse_open(&self) {
        self.refuse_open.store(true, Ordering::SeqCst);
    }

    /// Reports that were written successfully.
    pub(crate) fn reports(&self) -> Vec<Vec<u8>> {
        lock(&self.reports).clone()
    }

    pub(crate) fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }
}

impl Transport for FakeTransport {
    type Writer = FakeWriter;

    fn open(&self, serial_number: u32) -> Result<FakeWriter> {
        if self.refuse_open.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable(serial_number));
        }
        Ok(FakeWriter {
            report_len: self.report_len,
            reports: Arc::clone(&self.reports),
            failures: Arc::clone(&self.failures),
            on_reboot: self.on_reboot.clone(),
        })
    }

    fn start_bootloader(&self, port: &str) -> Result<()> {
        lock(&self.started).push(port.to_string());
        if let Some(hook) = &self.on_start {
            hook();
        }
        Ok(())
    }
}

pub(crate) struct FakeWriter {
    report_len: usize,
    reports: Arc<Mutex<Vec<Vec<u8>>>>,
    failures: Arc<Mutex<VecDeque<bool>>>,
    on_reboot: Option<Hook>,
}

impl ReportWriter for FakeWriter {
    fn report_len(&self) -> usize {
        self.report_len
    }

    fn write_report(&mut self, report: &[u8]) -> Result<()> {
        assert_eq!(report.len(), self.report_len);
        if lock(&self.failures).pop_front() == Some(true) {
            return Err(Error::Usb(rusb::Error::Io));
        }
        lock(&self.reports).push(report.to_vec());

        if report.iter().all(|b| *b == 0xff) {
            if let Some(hook) = &self.on_reboot {
                hook();
            }
        }
        Ok(())
    }
}

type SinkSlot = Arc<Mutex<Option<EventSink<DeviceDescriptor>>>>;

/// Serves a fixed device list; events are injected with [`fire`](#method.fire). Descriptors with
/// vendor 0 cannot be described.
#[derive(Clone)]
pub(crate) struct FakeDiscovery {
    attached: Vec<DeviceDescriptor>,
    sink: SinkSlot,
    refuse_subscribe: bool,
}

impl FakeDiscovery {
    pub(crate) fn new(attached: Vec<DeviceDescriptor>) -> Self {
        FakeDiscovery {
            attached,
            sink: Arc::new(Mutex::new(None)),
            refuse_subscribe: false,
        }
    }

    pub(crate) fn refusing_subscribe(mut self) -> Self {
        self.refuse_subscribe = true;
        self
    }

    pub(crate) fn fire(&self, event: HotplugEvent<DeviceDescriptor>) {
        if let Some(sink) = lock(&self.sink).as_ref() {
            sink(event);
        }
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        lock(&self.sink).is_some()
    }
}

impl Discovery for FakeDiscovery {
    type Device = DeviceDescriptor;
    type Watch = FakeWatch;

    fn list_attached(&self, vendor_id: u16) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .attached
            .iter()
            .filter(|descriptor| descriptor.vendor_id == vendor_id)
            .cloned()
            .collect())
    }

    fn describe(&self, device: &DeviceDescriptor) -> Result<DeviceDescriptor> {
        if device.vendor_id == 0 {
            return Err(Error::Usb(rusb::Error::NoDevice));
        }
        Ok(device.clone())
    }

    fn subscribe(&self, _: u16, sink: EventSink<DeviceDescriptor>) -> Result<FakeWatch> {
        if self.refuse_subscribe {
            return Err(Error::Usb(rusb::Error::NotSupported));
        }
        *lock(&self.sink) = Some(sink);
        Ok(FakeWatch {
            sink: Arc::clone(&self.sink),
        })
    }
}

pub(crate) struct FakeWatch {
    sink: SinkSlot,
}

impl Drop for FakeWatch {
    fn drop(&mut self) {
        lock(&self.sink).take();
    }
}
