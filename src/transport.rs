//! Interfaces to the host's USB stack. The rest of the crate only talks to boards through these
//! traits; [`usb`] implements them with libusb.
//!
//! [`usb`]: ../usb/index.html

use crate::error::Result;

/// Opens HalfKay devices and asks running boards to enter their bootloader.
pub trait Transport {
    type Writer: ReportWriter;

    /// Opens the board with the given serial number, which must be in flashing mode. The handle
    /// is released when the writer is dropped.
    fn open(&self, serial_number: u32) -> Result<Self::Writer>;

    /// Makes the board whose serial interface is at `port` reboot into its bootloader.
    fn start_bootloader(&self, port: &str) -> Result<()>;
}

/// An open HalfKay device accepting fixed-size reports.
pub trait ReportWriter {
    /// Length every report passed to [`write_report`] must have.
    ///
    /// [`write_report`]: #tymethod.write_report
    fn report_len(&self) -> usize;

    /// Blocks until the device has accepted the report.
    fn write_report(&mut self, report: &[u8]) -> Result<()>;
}

/// Raw identity of an attached USB device.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,

    /// Device release number (`bcdDevice`).
    pub revision: u16,

    /// Usage code of the device's HID interface, if it has one.
    pub usage: Option<u16>,

    /// Serial number string descriptor.
    pub serial: Option<String>,

    /// Identifier of the serial port the device provides, if any.
    pub port: Option<String>,
}

/// A device change delivered by the operating system.
#[derive(Clone, Debug)]
pub enum HotplugEvent<D> {
    Arrived(D),
    Left(D),
}

/// Receives hot-plug events. It is called on the operating system's notification thread and must
/// return quickly.
pub type EventSink<D> = Box<dyn Fn(HotplugEvent<D>) + Send + Sync>;

/// Enumerates attached devices and reports devices coming and going.
pub trait Discovery: Send + Sync + 'static {
    /// Device reference carried by hot-plug events.
    type Device: Send + 'static;

    /// Keeps the subscription alive. Dropping it stops event delivery.
    type Watch;

    /// Lists all currently attached devices of a vendor.
    fn list_attached(&self, vendor_id: u16) -> Result<Vec<DeviceDescriptor>>;

    /// Reads the identity of a device from a hot-plug event. This may block on USB I/O and is
    /// never called from the notification thread.
    fn describe(&self, device: &Self::Device) -> Result<DeviceDescriptor>;

    /// Starts delivering hot-plug events for devices of a vendor.
    fn subscribe(&self, vendor_id: u16, sink: EventSink<Self::Device>) -> Result<Self::Watch>;
}
