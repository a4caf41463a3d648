//! This crate flashes Teensy boards through the HalfKay USB bootloader. It keeps track of attached
//! boards while they switch between running their application and running the bootloader, decodes
//! Intel HEX firmware images and uploads them.
//!
//! # Example: Basic flashing
//! ```rust, no_run
//! use halfkay::{Config, DeviceRegistry, FirmwareImage, UploadResult, Uploader};
//! use halfkay::usb::{UsbDiscovery, UsbTransport};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//!
//! // Find the single attached board
//! let registry = DeviceRegistry::new(UsbDiscovery::new(config.clone())?, config.clone())?;
//! let device = registry.pick(None)?;
//!
//! // Read the firmware for it
//! let image = FirmwareImage::open("blink.hex", device.profile().flash_size)?;
//! if !image.is_likely_valid_for(device.family()) {
//!     println!("The image may not be built for {}", device.name());
//! }
//!
//! // Upload it, which also switches the board into its bootloader and back
//! let transport = UsbTransport::new(config.clone())?;
//! let mut uploader = Uploader::new(&transport, &config);
//! uploader.on_progress(|progress| println!("{}/{}", progress.processed, progress.total));
//! match uploader.upload(&image, &device) {
//!     UploadResult::Success => println!("Done!"),
//!     result => println!("Upload failed: {:?}", result),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The USB stack is reached through the [`Transport`] and [`Discovery`] traits, so everything
//! except the [`usb`] module works without hardware.
//!
//! [`Transport`]: trait.Transport.html
//! [`Discovery`]: trait.Discovery.html
//! [`usb`]: usb/index.html

mod config;
mod device;
mod error;
mod family;
mod hex;
mod operation;
mod registry;
mod transport;
mod upload;
pub mod usb;

#[cfg(test)]
mod testing;

pub use config::{Config, MIN_MODE_TIMEOUT};
pub use device::{Connection, ConnectionMode, Device, StateListener};
pub use error::{Error, FormatError, Result};
pub use family::{
    resolve_profile, AddressEncoding, AddressKind, BoardFamily, ByteOrder, DeviceProfile,
    ImageSignature,
};
pub use hex::{Block, Blocks, FirmwareImage, HexDecoder, ERASE_VALUE};
pub use operation::{Operation, Program};
pub use registry::{
    normalize_bootloader_serial, parse_bootloader_serial, AddedListener, Candidate, DeviceRegistry,
};
pub use transport::{
    DeviceDescriptor, Discovery, EventSink, HotplugEvent, ReportWriter, Transport,
};
pub use upload::{Progress, UploadResult, Uploader};
