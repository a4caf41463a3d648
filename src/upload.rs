use crate::config::Config;
use crate::device::{notify, ConnectionMode, Device};
use crate::error::{Error, Result};
use crate::hex::FirmwareImage;
use crate::operation::{Operation, Program};
use crate::transport::{ReportWriter, Transport};
use log::{error, info, warn};
use std::thread;
use std::time::Duration;

/// Outcome of [`Uploader::upload`].
///
/// [`Uploader::upload`]: struct.Uploader.html#method.upload
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UploadResult {
    /// The image was written and the board rebooted into it.
    Success,

    /// The image was written, but the board did not come back after the reboot request. It has to
    /// be power-cycled.
    SuccessRebootFailed,

    /// The board could not be put into or found in flashing mode.
    ErrorDeviceUnavailable,

    /// The image does not fit the board.
    ErrorInvalidImage,

    /// Writing a block failed twice. If this happened on the first block the flash is erased and
    /// the board may need a power cycle.
    ErrorWrite,
}

impl UploadResult {
    /// Whether the image was written completely.
    pub fn is_success(self) -> bool {
        matches!(self, UploadResult::Success | UploadResult::SuccessRebootFailed)
    }
}

/// Upload progress in bytes of the image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

/// Drives the HalfKay protocol: switches boards into their bootloader, writes images and reboots
/// them.
pub struct Uploader<'a, T: Transport> {
    transport: &'a T,
    mode_timeout: Duration,
    listeners: Vec<Box<dyn FnMut(Progress) + 'a>>,
    pace: fn(Duration),
}

impl<'a, T: Transport> Uploader<'a, T> {
    pub fn new(transport: &'a T, config: &Config) -> Self {
        Uploader {
            transport,
            mode_timeout: config.mode_timeout(),
            listeners: Vec::new(),
            pace: thread::sleep,
        }
    }

    /// Registers a callback receiving progress after every written block, and once more with
    /// `processed == total` when an upload ends.
    pub fn on_progress<F>(&mut self, listener: F) -> &mut Self
    where
        F: FnMut(Progress) + 'a,
    {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Replaces the sleeps the board needs between blocks.
    #[cfg(test)]
    pub(crate) fn with_pace(mut self, pace: fn(Duration)) -> Self {
        self.pace = pace;
        self
    }

    /// Makes sure the board runs its bootloader. A board in normal mode is asked to switch and
    /// this call blocks until the switch has been observed.
    pub fn start_bootloader(&self, device: &Device) -> Result<()> {
        let connection = device.connection();
        match (connection.mode, connection.port) {
            (ConnectionMode::Flashing, _) => Ok(()),
            (ConnectionMode::Normal, Some(port)) => {
                info!("Starting {} bootloader", device.name());
                device.await_mode(ConnectionMode::Flashing, self.mode_timeout, || {
                    self.transport.start_bootloader(&port)
                })
            }
            _ => Err(Error::DeviceUnavailable(device.serial_number())),
        }
    }

    /// Reboots the board into its application, entering the bootloader first if needed.
    pub fn reboot(&self, device: &Device) -> Result<()> {
        self.start_bootloader(device)?;
        let mut writer = self.transport.open(device.serial_number())?;
        self.send_reboot(&mut writer, device)
    }

    fn send_reboot(&self, writer: &mut T::Writer, device: &Device) -> Result<()> {
        let header = device.profile().data_offset;
        if writer.report_len() < header {
            return Err(Error::ReportTooSmall {
                needed: header,
                available: writer.report_len(),
            });
        }
        // An all-ones report makes HalfKay jump to the application
        let report = vec![0xff; writer.report_len()];

        info!("Rebooting {}", device.name());
        device.await_mode(ConnectionMode::Normal, self.mode_timeout, || {
            writer.write_report(&report)
        })
    }

    /// Writes `image` into the board's flash and reboots it. The board is switched into its
    /// bootloader first if it runs its application.
    pub fn upload(&mut self, image: &FirmwareImage, device: &Device) -> UploadResult {
        let profile = device.profile();
        if image.len() != profile.flash_size {
            error!(
                "Image of {} bytes does not match the {} byte flash of {}",
                image.len(),
                profile.flash_size,
                device.name()
            );
            return UploadResult::ErrorInvalidImage;
        }
        if profile.signature.is_some() && !image.is_likely_valid_for(device.family()) {
            warn!("The image may not have been built for {}", device.name());
        }

        if let Err(error) = self.start_bootloader(device) {
            error!("{} bootloader is not available: {}", device, error);
            return UploadResult::ErrorDeviceUnavailable;
        }
        let mut writer = match self.transport.open(device.serial_number()) {
            Ok(writer) => writer,
            Err(error) => {
                error!("Could not open {}: {}", device, error);
                return UploadResult::ErrorDeviceUnavailable;
            }
        };

        let mut result = UploadResult::Success;
        match Program::new(&mut writer, image, profile) {
            Ok(program) => {
                let program = program.with_pace(self.pace);
                let total = program.total();
                for step in program {
                    match step {
                        Ok(processed) => self.emit(Progress { processed, total }),
                        Err(error) => {
                            error!("Writing to {} failed: {}", device, error);
                            result = UploadResult::ErrorWrite;
                        }
                    }
                }
            }
            Err(error) => {
                error!("{} cannot be programmed: {}", device, error);
                return UploadResult::ErrorDeviceUnavailable;
            }
        }

        // Always reboot, a board left in the bootloader is unusable.
        if let Err(error) = self.send_reboot(&mut writer, device) {
            warn!("{} did not reboot: {}", device, error);
            if result == UploadResult::Success {
                result = UploadResult::SuccessRebootFailed;
            }
        }

        self.emit(Progress {
            processed: image.len(),
            total: image.len(),
        });
        if result.is_success() {
            info!("{} upload complete", device.name());
        }
        result
    }

    fn emit(&mut self, progress: Progress) {
        for listener in self.listeners.iter_mut() {
            notify("progress", || listener(progress));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::BoardFamily;
    use crate::registry::DeviceRegistry;
    use crate::testing::{
        bootloader_descriptor, hex_record, runtime_descriptor, wait_until, FakeDiscovery,
        FakeTransport,
    };
    use crate::transport::HotplugEvent;
    use std::cell::RefCell;
    use std::sync::Arc;

    fn no_pace(_: Duration) {}

    fn image_with(family: BoardFamily, bytes: &[(usize, u8)]) -> FirmwareImage {
        let mut text = String::new();
        for (offset, value) in bytes {
            let upper = ((*offset >> 16) as u16).to_be_bytes();
            text.push_str(&hex_record(0x04, 0, &upper));
            text.push_str(&hex_record(0x00, *offset as u16, &[*value]));
        }
        text.push_str(&hex_record(0x01, 0, &[]));

        FirmwareImage::parse(&text, family.profile().unwrap().flash_size).unwrap()
    }

    fn flashing_device(family: BoardFamily) -> Arc<Device> {
        Arc::new(Device::new(family, 4711, ConnectionMode::Flashing, None).unwrap())
    }

    #[test]
    fn sends_first_block_and_non_empty_blocks_only() {
        let device = flashing_device(BoardFamily::Teensy2);
        let transport = FakeTransport::rebooting(&device);
        let image = image_with(BoardFamily::Teensy2, &[(5 * 128 + 7, 0x5a)]);

        let result = Uploader::new(&transport, &Config::default())
            .with_pace(no_pace)
            .upload(&image, &device);

        assert_eq!(result, UploadResult::Success);
        let reports = transport.reports();
        assert_eq!(reports.len(), 3);
        assert_eq!(&reports[0][..3], &[0x00, 0x00, 0xff]);
        assert_eq!(&reports[1][..2], &[0x80, 0x02]);
        assert_eq!(reports[1][2 + 7], 0x5a);
        assert!(reports[2].iter().all(|b| *b == 0xff));
        assert_eq!(device.mode(), ConnectionMode::Normal);
    }

    #[test]
    fn arm_reports_carry_payload_after_header() {
        let device = flashing_device(BoardFamily::TeensyLc);
        let transport = FakeTransport::rebooting(&device);
        let image = image_with(BoardFamily::TeensyLc, &[(0xe200, 0x11)]);

        let result = Uploader::new(&transport, &Config::default())
            .with_pace(no_pace)
            .upload(&image, &device);

        assert_eq!(result, UploadResult::Success);
        let reports = transport.reports();
        assert_eq!(reports[0].len(), 576);
        assert_eq!(&reports[1][..3], &[0x00, 0xe2, 0x00]);
        assert!(reports[1][3..64].iter().all(|b| *b == 0));
        assert_eq!(reports[1][64], 0x11);
    }

    #[test]
    fn reboot_report_is_all_ones() {
        let device = flashing_device(BoardFamily::TeensyLc);
        let transport = FakeTransport::rebooting(&device);
        let image = image_with(BoardFamily::TeensyLc, &[]);

        let result = Uploader::new(&transport, &Config::default())
            .with_pace(no_pace)
            .upload(&image, &device);

        assert_eq!(result, UploadResult::Success);
        let reports = transport.reports();
        let reboot = &reports[reports.len() - 1];
        assert_eq!(reboot.len(), 576);
        assert!(reboot.iter().all(|b| *b == 0xff));
    }

    #[test]
    fn reports_progress_and_final_total() {
        let device = flashing_device(BoardFamily::Teensy2);
        let transport = FakeTransport::rebooting(&device);
        let image = image_with(BoardFamily::Teensy2, &[(300, 1)]);
        let seen = RefCell::new(Vec::new());

        let mut uploader = Uploader::new(&transport, &Config::default()).with_pace(no_pace);
        uploader.on_progress(|progress| seen.borrow_mut().push(progress.processed));
        uploader.upload(&image, &device);
        drop(uploader);

        let total = image.len();
        assert_eq!(seen.into_inner(), vec![128, 384, total]);
    }

    #[test]
    fn retries_a_failed_write_once() {
        let device = flashing_device(BoardFamily::Teensy2);
        let transport = FakeTransport::rebooting(&device);
        transport.fail_writes(&[true, false]);
        let image = image_with(BoardFamily::Teensy2, &[]);

        let result = Uploader::new(&transport, &Config::default())
            .with_pace(no_pace)
            .upload(&image, &device);

        assert_eq!(result, UploadResult::Success);
        assert_eq!(transport.reports().len(), 2);
    }

    #[test]
    fn second_write_failure_aborts_but_still_reboots() {
        let device = flashing_device(BoardFamily::Teensy2);
        let transport = FakeTransport::rebooting(&device);
        transport.fail_writes(&[false, true, true]);
        let image = image_with(BoardFamily::Teensy2, &[(200, 1), (400, 2), (600, 3)]);
        let seen = RefCell::new(Vec::new());

        let mut uploader = Uploader::new(&transport, &Config::default()).with_pace(no_pace);
        uploader.on_progress(|progress| seen.borrow_mut().push(progress.processed));
        let result = uploader.upload(&image, &device);
        drop(uploader);

        assert_eq!(result, UploadResult::ErrorWrite);
        let reports = transport.reports();
        // first block, then the reboot request
        assert_eq!(reports.len(), 2);
        assert!(reports[1].iter().all(|b| *b == 0xff));
        assert_eq!(seen.into_inner(), vec![128, image.len()]);
    }

    #[test]
    fn failed_reboot_downgrades_success() {
        let device = flashing_device(BoardFamily::Teensy2);
        let transport = FakeTransport::rebooting(&device);
        transport.fail_writes(&[false, true]);
        let image = image_with(BoardFamily::Teensy2, &[]);

        let result = Uploader::new(&transport, &Config::default())
            .with_pace(no_pace)
            .upload(&image, &device);

        assert_eq!(result, UploadResult::SuccessRebootFailed);
        assert!(result.is_success());
    }

    #[test]
    fn image_for_another_board_is_rejected() {
        let device = flashing_device(BoardFamily::Teensy2);
        let transport = FakeTransport::rebooting(&device);
        let image = image_with(BoardFamily::TeensyLc, &[]);

        let result = Uploader::new(&transport, &Config::default()).upload(&image, &device);

        assert_eq!(result, UploadResult::ErrorInvalidImage);
        assert!(transport.reports().is_empty());
    }

    #[test]
    fn disconnected_board_is_unavailable() {
        let device = flashing_device(BoardFamily::Teensy2);
        device.transition(ConnectionMode::Disconnected, None);
        let transport = FakeTransport::rebooting(&device);
        let image = image_with(BoardFamily::Teensy2, &[]);

        let result = Uploader::new(&transport, &Config::default()).upload(&image, &device);

        assert_eq!(result, UploadResult::ErrorDeviceUnavailable);
        assert!(transport.reports().is_empty());
    }

    #[test]
    fn unopenable_board_is_unavailable() {
        let device = flashing_device(BoardFamily::Teensy2);
        let transport = FakeTransport::rebooting(&device);
        transport.refuse_open();
        let image = image_with(BoardFamily::Teensy2, &[]);

        let result = Uploader::new(&transport, &Config::default()).upload(&image, &device);
        assert_eq!(result, UploadResult::ErrorDeviceUnavailable);
    }

    #[test]
    fn short_reports_are_refused() {
        let device = flashing_device(BoardFamily::TeensyLc);
        let transport = FakeTransport::rebooting(&device).with_report_len(130);
        let image = image_with(BoardFamily::TeensyLc, &[]);

        let result = Uploader::new(&transport, &Config::default()).upload(&image, &device);
        assert_eq!(result, UploadResult::ErrorDeviceUnavailable);
        assert!(transport.reports().is_empty());
    }

    #[test]
    fn running_board_is_switched_into_bootloader() {
        let device = Arc::new(
            Device::new(
                BoardFamily::Teensy2,
                4711,
                ConnectionMode::Normal,
                Some("003:007".to_string()),
            )
            .unwrap(),
        );
        let transport = FakeTransport::rebooting(&device);
        let image = image_with(BoardFamily::Teensy2, &[]);

        let result = Uploader::new(&transport, &Config::default())
            .with_pace(no_pace)
            .upload(&image, &device);

        assert_eq!(result, UploadResult::Success);
        assert_eq!(transport.started(), vec!["003:007".to_string()]);
    }

    #[test]
    fn upload_round_trip_through_registry() {
        let discovery = FakeDiscovery::new(vec![runtime_descriptor(0x0276, "1234560", "001:004")]);
        let registry = DeviceRegistry::new(discovery.clone(), Config::default()).unwrap();
        let device = registry.find(Some(1234560), None).unwrap();
        assert_eq!(device.family(), BoardFamily::Teensy35);

        // The board re-enumerates under its other identity whenever it switches modes
        let transport = {
            let to_bootloader = discovery.clone();
            let to_runtime = discovery.clone();
            FakeTransport::new(1088)
                .on_start(move || {
                    to_bootloader.fire(HotplugEvent::Left(runtime_descriptor(
                        0x0276, "1234560", "001:004",
                    )));
                    to_bootloader.fire(HotplugEvent::Arrived(bootloader_descriptor(
                        0x1f, "0001E240",
                    )));
                })
                .on_reboot(move || {
                    to_runtime.fire(HotplugEvent::Left(bootloader_descriptor(0x1f, "0001E240")));
                    to_runtime.fire(HotplugEvent::Arrived(runtime_descriptor(
                        0x0276, "1234560", "001:005",
                    )));
                })
        };
        let image = image_with(BoardFamily::Teensy35, &[(0x400, 0x42)]);

        let result = Uploader::new(&transport, &Config::default())
            .with_pace(no_pace)
            .upload(&image, &device);

        assert_eq!(result, UploadResult::Success);
        assert_eq!(transport.reports().len(), 3);
        assert!(wait_until(|| device.port().as_deref() == Some("001:005")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reboot_enters_bootloader_first() {
        let device = Arc::new(
            Device::new(
                BoardFamily::Teensy36,
                99,
                ConnectionMode::Normal,
                Some("002:002".to_string()),
            )
            .unwrap(),
        );
        let transport = FakeTransport::rebooting(&device).with_report_len(1088);

        Uploader::new(&transport, &Config::default())
            .reboot(&device)
            .unwrap();

        assert_eq!(transport.started().len(), 1);
        let reports = transport.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].iter().all(|b| *b == 0xff));
        assert_eq!(device.mode(), ConnectionMode::Normal);
    }
}
