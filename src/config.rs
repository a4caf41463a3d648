use std::time::Duration;

/// Shortest time a caller may wait for a board to switch modes. Boards need about this long to
/// re-enumerate after a reboot.
pub const MIN_MODE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings shared by the registry, the uploader and the USB collaborators.
///
/// # Examples
///
/// ```rust
/// use halfkay::Config;
/// use std::time::Duration;
///
/// let config = Config::default().with_mode_timeout(Duration::from_secs(1));
/// assert_eq!(config.mode_timeout(), Duration::from_secs(5));
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// USB vendor ID shared by all supported boards in both modes.
    pub vendor_id: u16,

    /// USB product ID of a board running its application with a serial interface.
    pub runtime_product_id: u16,

    /// USB product ID of a board running the HalfKay bootloader.
    pub bootloader_product_id: u16,

    /// Line rate which makes a running board jump into its bootloader.
    pub magic_baud_rate: u32,

    /// Timeout for single USB control transfers.
    pub usb_timeout: Duration,

    mode_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vendor_id: 0x16c0,
            runtime_product_id: 0x0483,
            bootloader_product_id: 0x0478,
            magic_baud_rate: 134,
            usb_timeout: Duration::from_millis(500),
            mode_timeout: MIN_MODE_TIMEOUT,
        }
    }
}

impl Config {
    /// How long to wait for a board to enter the bootloader or to come back after a reboot.
    pub fn mode_timeout(&self) -> Duration {
        self.mode_timeout
    }

    /// Sets the mode switch timeout. Values below [`MIN_MODE_TIMEOUT`] are raised to it.
    ///
    /// [`MIN_MODE_TIMEOUT`]: constant.MIN_MODE_TIMEOUT.html
    pub fn with_mode_timeout(mut self, timeout: Duration) -> Self {
        self.mode_timeout = timeout.max(MIN_MODE_TIMEOUT);
        self
    }
}
