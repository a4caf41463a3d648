use crate::error::{Error, Result};
use crate::family::{BoardFamily, DeviceProfile};
use log::{info, warn};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The USB identity a board currently presents.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionMode {
    /// The board is not attached.
    Disconnected,

    /// The board runs the HalfKay bootloader and accepts uploads.
    Flashing,

    /// The board runs its application and exposes a serial port.
    Normal,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionMode::Disconnected => "disconnected",
            ConnectionMode::Flashing => "flashing",
            ConnectionMode::Normal => "normal",
        })
    }
}

/// Snapshot of a board's connection state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Connection {
    pub mode: ConnectionMode,

    /// Port of the board's serial interface. Only present in [`ConnectionMode::Normal`].
    ///
    /// [`ConnectionMode::Normal`]: enum.ConnectionMode.html#variant.Normal
    pub port: Option<String>,
}

/// Callback invoked after a board changed its connection mode.
pub type StateListener = Arc<dyn Fn(&Device) + Send + Sync>;

/// Locks a mutex, ignoring poisoning. Every critical section in this crate leaves its data
/// consistent, so a panic elsewhere does not invalidate it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a subscriber callback, keeping a panic inside it from reaching the notifying thread.
pub(crate) fn notify<F: FnOnce()>(what: &str, callback: F) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!("A {} listener panicked", what);
    }
}

/// Manual-reset event signalling that a board reached a mode.
struct ModeSignal {
    raised: Mutex<bool>,
    condvar: Condvar,
}

impl ModeSignal {
    fn new() -> Self {
        ModeSignal {
            raised: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn raise(&self) {
        *lock(&self.raised) = true;
        self.condvar.notify_all();
    }

    fn reset(&self) {
        *lock(&self.raised) = false;
    }

    /// Returns whether the signal was raised before the timeout expired.
    fn wait(&self, timeout: Duration) -> bool {
        let raised = lock(&self.raised);
        let (raised, _) = self
            .condvar
            .wait_timeout_while(raised, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *raised
    }
}

/// A physical board. Identity (family and serial number) is fixed, the connection state follows
/// the board through disconnects and mode switches.
pub struct Device {
    profile: &'static DeviceProfile,
    serial_number: u32,
    connection: Mutex<Connection>,
    flashing: ModeSignal,
    normal: ModeSignal,
    listeners: Mutex<Vec<StateListener>>,
}

impl Device {
    /// Creates a board record. The serial number must not be zero; a port is only kept in
    /// normal mode.
    pub fn new(
        family: BoardFamily,
        serial_number: u32,
        mode: ConnectionMode,
        port: Option<String>,
    ) -> Result<Self> {
        if serial_number == 0 {
            return Err(Error::InvalidRequest);
        }

        Ok(Device {
            profile: family.profile()?,
            serial_number,
            connection: Mutex::new(Connection {
                mode,
                port: port.filter(|_| mode == ConnectionMode::Normal),
            }),
            flashing: ModeSignal::new(),
            normal: ModeSignal::new(),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn family(&self) -> BoardFamily {
        self.profile.family
    }

    pub fn profile(&self) -> &'static DeviceProfile {
        self.profile
    }

    /// Board name, e.g. "Teensy 4.0".
    pub fn name(&self) -> &'static str {
        self.profile.name
    }

    pub fn serial_number(&self) -> u32 {
        self.serial_number
    }

    /// Returns mode and port as one consistent snapshot.
    pub fn connection(&self) -> Connection {
        lock(&self.connection).clone()
    }

    pub fn mode(&self) -> ConnectionMode {
        lock(&self.connection).mode
    }

    pub fn port(&self) -> Option<String> {
        lock(&self.connection).port.clone()
    }

    /// Registers a callback which runs on every mode change, in registration order.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&Device) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(listener));
    }

    /// Moves the board to a new connection state. Returns whether anything changed. A mode change
    /// wakes up waiters for that mode and runs all state change listeners before returning.
    pub fn transition(&self, mode: ConnectionMode, port: Option<String>) -> bool {
        let port = port.filter(|_| mode == ConnectionMode::Normal);

        let mode_changed = {
            let mut connection = lock(&self.connection);
            if connection.mode == mode && connection.port == port {
                return false;
            }
            let mode_changed = connection.mode != mode;
            connection.mode = mode;
            connection.port = port;
            mode_changed
        };

        if mode_changed {
            match mode {
                ConnectionMode::Flashing => {
                    info!("{} bootloader running", self.name());
                    self.flashing.raise();
                }
                ConnectionMode::Normal => {
                    info!("{} connected", self.name());
                    self.normal.raise();
                }
                ConnectionMode::Disconnected => info!("{} disconnected", self.name()),
            }

            let listeners = lock(&self.listeners).clone();
            for listener in listeners {
                notify("state change", || listener(self));
            }
        }

        true
    }

    /// Runs `trigger` and blocks until the board reports `mode` or `timeout` expires. The signal
    /// is cleared before `trigger` runs, so only a mode change caused after this call counts.
    pub fn await_mode<F>(&self, mode: ConnectionMode, timeout: Duration, trigger: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let signal = match mode {
            ConnectionMode::Flashing => &self.flashing,
            ConnectionMode::Normal => &self.normal,
            ConnectionMode::Disconnected => return Err(Error::InvalidRequest),
        };

        signal.reset();
        trigger()?;

        if signal.wait(timeout) {
            Ok(())
        } else {
            Err(Error::Timeout(mode))
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("family", &self.family())
            .field("serial_number", &self.serial_number)
            .field("connection", &self.connection())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connection = self.connection();
        match (connection.mode, connection.port) {
            (ConnectionMode::Flashing, _) => write!(
                f,
                "Bootloader for {} Serial Number {}",
                self.name(),
                self.serial_number
            ),
            (ConnectionMode::Normal, Some(port)) => write!(
                f,
                "{} Serial Number {} on {}",
                self.name(),
                self.serial_number,
                port
            ),
            (ConnectionMode::Normal, None) => {
                write!(f, "{} Serial Number {}", self.name(), self.serial_number)
            }
            (ConnectionMode::Disconnected, _) => write!(
                f,
                "Disconnected {} Serial Number {}",
                self.name(),
                self.serial_number
            ),
        }
    }
}
