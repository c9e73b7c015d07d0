//! Device handles for connected execution targets.
//!
//! A [`Device`] is identified by a unique serial and exposes a handful of
//! properties plus the remote primitives the coordinator needs: reboot and
//! diagnostic capture (bugreport, logcat, screenshot). Diagnostic captures
//! are returned as opaque byte buffers; where they are written is the
//! caller's concern.
//!
//! # Implementations
//!
//! | Implementation | Module | Description |
//! |----------------|--------|-------------|
//! | Command | [`command`] | Shell command templates (e.g. `adb -s {serial} ...`) |

pub mod command;

use async_trait::async_trait;

/// Property holding the build fingerprint.
pub const BUILD_FINGERPRINT: &str = "ro.build.fingerprint";

/// Property holding the build type (`user`, `userdebug`, `eng`).
pub const BUILD_TYPE: &str = "ro.build.type";

/// Property holding the comma-separated list of supported ABIs.
pub const ABI_LIST: &str = "ro.product.cpu.abilist";

/// Property set to `1` once the device has finished booting.
pub const BOOT_COMPLETED: &str = "sys.boot_completed";

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur while talking to a device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device stopped responding and could not be recovered.
    #[error("Device {0} not available")]
    NotAvailable(String),

    /// A device command ran but reported failure.
    #[error("Device command failed on {serial}: {message}")]
    CommandFailed { serial: String, message: String },

    /// A device command did not finish in time.
    #[error("Device command timed out on {0}")]
    Timeout(String),

    /// I/O error while spawning or reading a command.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected execution target.
///
/// Implementations must be `Send + Sync`: one coordinator task owns each
/// device, but executors and health checkers borrow it across awaits.
#[async_trait]
pub trait Device: Send + Sync {
    /// Returns the unique serial of the device.
    fn serial(&self) -> &str;

    /// Reads a system property.
    async fn get_property(&self, key: &str) -> DeviceResult<String>;

    /// Reboots the device and waits until it is reachable again.
    async fn reboot(&self) -> DeviceResult<()>;

    /// Captures a bugreport.
    async fn bugreport(&self) -> DeviceResult<Vec<u8>>;

    /// Captures the current log buffer.
    async fn logcat(&self) -> DeviceResult<Vec<u8>>;

    /// Captures a screenshot (PNG).
    async fn screenshot(&self) -> DeviceResult<Vec<u8>>;

    /// Returns the build fingerprint.
    async fn build_fingerprint(&self) -> DeviceResult<String> {
        self.get_property(BUILD_FINGERPRINT).await
    }

    /// Returns the build type.
    async fn build_type(&self) -> DeviceResult<String> {
        self.get_property(BUILD_TYPE).await
    }

    /// Returns the architecture variants the device can run.
    async fn abis(&self) -> DeviceResult<Vec<String>> {
        let list = self.get_property(ABI_LIST).await?;
        Ok(list
            .split(',')
            .map(str::trim)
            .filter(|abi| !abi.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Returns `true` for emulator serials, which are never rebooted.
    fn is_emulator(&self) -> bool {
        self.serial().starts_with("emulator-")
    }
}
