//! libusb backed [`Transport`] and [`Discovery`].
//!
//! [`Transport`]: ../transport/trait.Transport.html
//! [`Discovery`]: ../transport/trait.Discovery.html

use crate::config::Config;
use crate::device::lock;
use crate::error::{Error, Result};
use crate::family::BoardFamily;
use crate::registry::parse_bootloader_serial;
use crate::transport::{
    DeviceDescriptor, Discovery, EventSink, HotplugEvent, ReportWriter, Transport,
};
use log::{debug, warn};
use rusb::{
    Context, Device, DeviceHandle, Direction, Hotplug, HotplugBuilder, Recipient, Registration,
    RequestType, UsbContext, Version,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const GET_DESCRIPTOR: u8 = 0x06;
const HID_REPORT_DESCRIPTOR: u16 = 0x2200;
const HID_SET_REPORT: u8 = 0x09;
const HID_OUTPUT_REPORT: u16 = 0x0200;
const CDC_SET_LINE_CODING: u8 = 0x20;

/// How long the event thread blocks in libusb before checking whether it should stop.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reassembles the `bcdDevice` field from its decoded form.
fn bcd_revision(version: Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

/// Port identifier of a device, "BUS:ADDRESS".
fn location<T: UsbContext>(device: &Device<T>) -> String {
    format!("{:03}:{:03}", device.bus_number(), device.address())
}

fn parse_location(port: &str) -> Option<(u8, u8)> {
    let (bus, address) = port.split_once(':')?;
    Some((bus.parse().ok()?, address.parse().ok()?))
}

/// Returns the first Usage item of a HID report descriptor.
pub(crate) fn hid_usage(descriptor: &[u8]) -> Option<u16> {
    let mut position = 0;
    while let Some(&prefix) = descriptor.get(position) {
        if prefix == 0xfe {
            // Long item: prefix, data size, tag, data
            let size = *descriptor.get(position + 1)? as usize;
            position += 3 + size;
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            size => size as usize,
        };
        let data = descriptor.get(position + 1..position + 1 + size)?;
        if prefix & 0xfc == 0x08 {
            return match data {
                [low] => Some(u16::from(*low)),
                [low, high, ..] => Some(u16::from_le_bytes([*low, *high])),
                _ => None,
            };
        }
        position += 1 + size;
    }
    None
}

fn read_usage<T: UsbContext>(handle: &DeviceHandle<T>, timeout: Duration) -> Result<u16> {
    let mut descriptor = [0u8; 256];
    let length = handle.read_control(
        rusb::request_type(Direction::In, RequestType::Standard, Recipient::Interface),
        GET_DESCRIPTOR,
        HID_REPORT_DESCRIPTOR,
        0,
        &mut descriptor,
        timeout,
    )?;
    hid_usage(&descriptor[..length])
        .ok_or_else(|| Error::UnsupportedDevice("HID interface without usage".to_string()))
}

fn describe_device<T: UsbContext>(device: &Device<T>, config: &Config) -> Result<DeviceDescriptor> {
    let usb_descriptor = device.device_descriptor()?;
    let mut descriptor = DeviceDescriptor {
        vendor_id: usb_descriptor.vendor_id(),
        product_id: usb_descriptor.product_id(),
        revision: bcd_revision(usb_descriptor.device_version()),
        ..DeviceDescriptor::default()
    };
    if descriptor.vendor_id != config.vendor_id {
        return Ok(descriptor);
    }

    let handle = device.open()?;
    descriptor.serial = handle.read_serial_number_string_ascii(&usb_descriptor).ok();
    if descriptor.product_id == config.bootloader_product_id {
        descriptor.usage = read_usage(&handle, config.usb_timeout).ok();
    } else if descriptor.product_id == config.runtime_product_id {
        descriptor.port = Some(location(device));
    }
    Ok(descriptor)
}

/// Talks to boards through libusb.
pub struct UsbTransport<T: UsbContext = Context> {
    context: T,
    config: Config,
}

impl UsbTransport<Context> {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_context(Context::new()?, config))
    }
}

impl<T: UsbContext> UsbTransport<T> {
    pub fn with_context(context: T, config: Config) -> Self {
        UsbTransport { context, config }
    }
}

impl<T: UsbContext> Transport for UsbTransport<T> {
    type Writer = UsbReportWriter<T>;

    fn open(&self, serial_number: u32) -> Result<UsbReportWriter<T>> {
        for device in self.context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != self.config.vendor_id
                || descriptor.product_id() != self.config.bootloader_product_id
            {
                continue;
            }

            let handle = match device.open() {
                Ok(handle) => handle,
                Err(error) => {
                    debug!("Cannot open bootloader at {}: {}", location(&device), error);
                    continue;
                }
            };
            let serial = handle
                .read_serial_number_string_ascii(&descriptor)
                .ok()
                .and_then(|serial| parse_bootloader_serial(&serial));
            if serial != Some(serial_number) {
                continue;
            }

            let usage = read_usage(&handle, self.config.usb_timeout)?;
            let profile = BoardFamily::from_bootloader_usage(usage)?.profile()?;
            return UsbReportWriter::new(handle, profile.report_len(), self.config.usb_timeout);
        }

        Err(Error::DeviceUnavailable(serial_number))
    }

    fn start_bootloader(&self, port: &str) -> Result<()> {
        let (bus, address) = parse_location(port).ok_or(Error::InvalidRequest)?;
        let device = self
            .context
            .devices()?
            .iter()
            .find(|device| device.bus_number() == bus && device.address() == address)
            .ok_or(Error::TargetNotFound)?;

        let mut handle = device.open()?;
        // Not supported on every platform
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(0)?;

        // 8N1 at the magic rate
        let mut line_coding = [0u8; 7];
        line_coding[..4].copy_from_slice(&self.config.magic_baud_rate.to_le_bytes());
        line_coding[6] = 8;

        let result = handle.write_control(
            rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface),
            CDC_SET_LINE_CODING,
            0,
            0,
            &line_coding,
            self.config.usb_timeout,
        );
        let _ = handle.release_interface(0);

        match result {
            // The board may reset before acknowledging
            Ok(_) | Err(rusb::Error::NoDevice) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Open HalfKay interface. The interface is released when the writer is dropped.
pub struct UsbReportWriter<T: UsbContext> {
    handle: DeviceHandle<T>,
    report_len: usize,
    timeout: Duration,
}

impl<T: UsbContext> UsbReportWriter<T> {
    fn new(mut handle: DeviceHandle<T>, report_len: usize, timeout: Duration) -> Result<Self> {
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(0)?;
        Ok(UsbReportWriter {
            handle,
            report_len,
            timeout,
        })
    }
}

impl<T: UsbContext> ReportWriter for UsbReportWriter<T> {
    fn report_len(&self) -> usize {
        self.report_len
    }

    fn write_report(&mut self, report: &[u8]) -> Result<()> {
        if report.len() != self.report_len {
            return Err(Error::InvalidRequest);
        }

        let written = self.handle.write_control(
            rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface),
            HID_SET_REPORT,
            HID_OUTPUT_REPORT,
            0,
            report,
            self.timeout,
        )?;
        if written == report.len() {
            Ok(())
        } else {
            Err(Error::Usb(rusb::Error::Io))
        }
    }
}

impl<T: UsbContext> Drop for UsbReportWriter<T> {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(0);
    }
}

/// Lists boards and follows hot-plug events through libusb.
pub struct UsbDiscovery<T: UsbContext = Context> {
    context: T,
    config: Config,

    /// Last known descriptor per bus position. Departed devices cannot be opened any more, so
    /// their identity is taken from here.
    known: Mutex<HashMap<(u8, u8), DeviceDescriptor>>,
}

impl UsbDiscovery<Context> {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_context(Context::new()?, config))
    }
}

impl<T: UsbContext> UsbDiscovery<T> {
    pub fn with_context(context: T, config: Config) -> Self {
        UsbDiscovery {
            context,
            config,
            known: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: UsbContext + 'static> Discovery for UsbDiscovery<T> {
    type Device = Device<T>;
    type Watch = UsbWatch<T>;

    fn list_attached(&self, vendor_id: u16) -> Result<Vec<DeviceDescriptor>> {
        let mut attached = Vec::new();
        for device in self.context.devices()?.iter() {
            match device.device_descriptor() {
                Ok(descriptor) if descriptor.vendor_id() == vendor_id => {}
                _ => continue,
            }

            match describe_device(&device, &self.config) {
                Ok(descriptor) => {
                    lock(&self.known)
                        .insert((device.bus_number(), device.address()), descriptor.clone());
                    attached.push(descriptor);
                }
                Err(error) => debug!("Skipping device at {}: {}", location(&device), error),
            }
        }
        Ok(attached)
    }

    fn describe(&self, device: &Device<T>) -> Result<DeviceDescriptor> {
        let key = (device.bus_number(), device.address());
        match describe_device(device, &self.config) {
            Ok(descriptor) => {
                lock(&self.known).insert(key, descriptor.clone());
                Ok(descriptor)
            }
            Err(error) => lock(&self.known).remove(&key).ok_or(error),
        }
    }

    fn subscribe(&self, vendor_id: u16, sink: EventSink<Device<T>>) -> Result<UsbWatch<T>> {
        if !rusb::has_hotplug() {
            return Err(Error::Usb(rusb::Error::NotSupported));
        }

        let mut builder = HotplugBuilder::new();
        builder.vendor_id(vendor_id).enumerate(false);
        let callback: Box<dyn Hotplug<T>> = Box::new(Forwarder { sink });
        let registration = builder.register(self.context.clone(), callback)?;

        let running = Arc::new(AtomicBool::new(true));
        let events = {
            let context = self.context.clone();
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("halfkay-usb-events".to_string())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        if let Err(error) = context.handle_events(Some(EVENT_POLL_INTERVAL)) {
                            warn!("USB event handling stopped: {}", error);
                            break;
                        }
                    }
                })?
        };

        Ok(UsbWatch {
            registration: Some(registration),
            running,
            events: Some(events),
        })
    }
}

struct Forwarder<T: UsbContext> {
    sink: EventSink<Device<T>>,
}

impl<T: UsbContext> Hotplug<T> for Forwarder<T> {
    fn device_arrived(&mut self, device: Device<T>) {
        (self.sink)(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<T>) {
        (self.sink)(HotplugEvent::Left(device));
    }
}

/// Active hot-plug subscription. Dropping it deregisters the callback and stops the event thread.
pub struct UsbWatch<T: UsbContext> {
    registration: Option<Registration<T>>,
    running: Arc<AtomicBool>,
    events: Option<JoinHandle<()>>,
}

impl<T: UsbContext> Drop for UsbWatch<T> {
    fn drop(&mut self) {
        self.registration.take();
        self.running.store(false, Ordering::Release);
        if let Some(events) = self.events.take() {
            let _ = events.join();
        }
    }
}
