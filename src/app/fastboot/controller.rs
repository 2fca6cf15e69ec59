use std::path::Path;
use std::time::Duration;

use crate::app::error::FlashError;
use crate::app::models::CommandResult;

/// Everything the flasher needs from a physical device.
///
/// Implementations report a device that stops responding as
/// `FlashError::DeviceUnavailable`; a completed command is always `Ok`, whatever
/// its status, so the caller can classify it.
pub trait DeviceController: Send + Sync {
    fn serial(&self) -> &str;

    fn reboot_into_bootloader(&self) -> Result<(), FlashError>;

    /// Reboots to userspace and waits until the device is online.
    fn reboot(&self) -> Result<(), FlashError>;

    fn reboot_into_recovery(&self) -> Result<(), FlashError>;

    fn wait_for_device_online(&self) -> Result<(), FlashError>;

    fn wait_for_device_available(&self, timeout: Duration) -> Result<(), FlashError>;

    fn execute_fastboot_command(&self, args: &[String]) -> Result<CommandResult, FlashError>;

    /// Same as `execute_fastboot_command` with the long-command timeout.
    fn execute_long_fastboot_command(&self, args: &[String]) -> Result<CommandResult, FlashError>;

    fn execute_fastboot_command_with_timeout(
        &self,
        timeout: Duration,
        args: &[String],
    ) -> Result<CommandResult, FlashError>;

    fn product_type(&self) -> Result<Option<String>, FlashError>;

    fn build_id(&self) -> Result<Option<String>, FlashError>;

    fn build_flavor(&self) -> Result<Option<String>, FlashError>;

    fn push_file(&self, local: &Path, remote: &str) -> Result<bool, FlashError>;

    fn push_dir(&self, local: &Path, remote: &str) -> Result<bool, FlashError>;

    /// Pushes only the files under `local` that differ from `remote`.
    fn sync_files(&self, local: &Path, remote: &str) -> Result<bool, FlashError>;

    fn does_file_exist(&self, remote: &str) -> Result<bool, FlashError>;

    fn execute_shell_command(&self, command: &str) -> Result<String, FlashError>;

    /// Erase or format, as chosen by `use_fastboot_erase`.
    fn fastboot_wipe_partition(&self, partition: &str) -> Result<CommandResult, FlashError> {
        let verb = if self.use_fastboot_erase() {
            "erase"
        } else {
            "format"
        };
        self.execute_long_fastboot_command(&[verb.to_string(), partition.to_string()])
    }

    fn use_fastboot_erase(&self) -> bool;
}
