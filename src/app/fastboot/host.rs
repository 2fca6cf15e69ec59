use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::error::FlashError;
use crate::app::fastboot::controller::DeviceController;
use crate::app::fastboot::parse::{
    needs_transport_recovery, parse_fastboot_devices, parse_fastboot_var, parse_getprop_value,
    shell_quote,
};
use crate::app::fastboot::runner::{run_command_with_timeout, RunnerError};
use crate::app::interrupt::InterruptGate;
use crate::app::models::{CommandResult, CommandStatus};

const MAX_FASTBOOT_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostControllerOptions {
    pub adb_program: String,
    pub fastboot_program: String,
    pub command_timeout: Duration,
    pub long_command_timeout: Duration,
    pub online_timeout: Duration,
    pub bootloader_timeout: Duration,
    pub use_fastboot_erase: bool,
    pub poll_interval: Duration,
}

impl Default for HostControllerOptions {
    fn default() -> Self {
        Self {
            adb_program: "adb".to_string(),
            fastboot_program: "fastboot".to_string(),
            command_timeout: Duration::from_secs(60),
            long_command_timeout: Duration::from_secs(25 * 60),
            online_timeout: Duration::from_secs(5 * 60),
            bootloader_timeout: Duration::from_secs(60),
            use_fastboot_erase: false,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Drives a real device through the host's `adb` and `fastboot` binaries.
pub struct HostDeviceController {
    serial: String,
    options: HostControllerOptions,
    gate: Arc<InterruptGate>,
    trace_id: String,
    // device state must not be polled while a fastboot command owns the device
    fastboot_lock: Mutex<()>,
}

impl HostDeviceController {
    pub fn new(
        serial: impl Into<String>,
        options: HostControllerOptions,
        gate: Arc<InterruptGate>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            serial: serial.into(),
            options,
            gate,
            trace_id: trace_id.into(),
            fastboot_lock: Mutex::new(()),
        }
    }

    fn map_runner_error(&self, err: RunnerError) -> FlashError {
        match err {
            RunnerError::Interrupted { program } => {
                FlashError::interrupted(&self.serial, format!("{program} killed on interrupt"))
            }
            other => FlashError::setup(&self.serial, other.to_string()),
        }
    }

    fn run(&self, program: &str, args: Vec<String>, timeout: Duration) -> Result<CommandResult, FlashError> {
        let mut full = vec!["-s".to_string(), self.serial.clone()];
        full.extend(args);
        run_command_with_timeout(program, &full, timeout, Some(&self.gate), &self.trace_id)
            .map_err(|err| self.map_runner_error(err))
    }

    fn adb(&self, args: &[&str], timeout: Duration) -> Result<CommandResult, FlashError> {
        let args = args.iter().map(|arg| arg.to_string()).collect();
        self.run(&self.options.adb_program, args, timeout)
    }

    fn is_in_fastboot(&self) -> Result<bool, FlashError> {
        let output = run_command_with_timeout(
            &self.options.fastboot_program,
            &["devices".to_string()],
            self.options.command_timeout,
            Some(&self.gate),
            &self.trace_id,
        )
        .map_err(|err| self.map_runner_error(err))?;
        Ok(parse_fastboot_devices(&output.stdout)
            .iter()
            .any(|serial| serial == &self.serial))
    }

    fn wait_for_bootloader(&self, timeout: Duration) -> Result<(), FlashError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_in_fastboot()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FlashError::unavailable(
                    &self.serial,
                    format!(
                        "device did not enter bootloader within {}s",
                        timeout.as_secs()
                    ),
                ));
            }
            std::thread::sleep(self.options.poll_interval);
        }
    }

    fn do_fastboot_command(&self, timeout: Duration, args: &[String]) -> Result<CommandResult, FlashError> {
        let command = args.first().cloned().unwrap_or_default();
        for attempt in 1..=MAX_FASTBOOT_ATTEMPTS {
            let result = {
                let _guard = self
                    .fastboot_lock
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                self.run(&self.options.fastboot_program, args.to_vec(), timeout)?
            };
            if !needs_transport_recovery(&result) {
                return Ok(result);
            }
            warn!(
                trace_id = %self.trace_id,
                serial = %self.serial,
                command = %command,
                attempt,
                stderr = %result.stderr.trim(),
                "bad fastboot response, waiting for bootloader"
            );
            self.wait_for_bootloader(self.options.bootloader_timeout)?;
        }
        Err(FlashError::unavailable(
            &self.serial,
            format!(
                "attempted fastboot {command} {MAX_FASTBOOT_ATTEMPTS} times without communication success"
            ),
        ))
    }

    fn getprop(&self, name: &str) -> Result<Option<String>, FlashError> {
        let output = self.execute_shell_command(&format!("getprop {name}"))?;
        Ok(parse_getprop_value(&output))
    }

    fn expect_success(&self, result: CommandResult, action: &str) -> Result<(), FlashError> {
        match result.status {
            CommandStatus::Success => Ok(()),
            CommandStatus::TimedOut => Err(FlashError::unavailable(
                &self.serial,
                format!("{action} timed out"),
            )),
            _ => Err(FlashError::unavailable(
                &self.serial,
                format!("{action} failed: {}", result.stderr.trim()),
            )),
        }
    }
}

impl DeviceController for HostDeviceController {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn reboot_into_bootloader(&self) -> Result<(), FlashError> {
        if self.is_in_fastboot()? {
            info!(serial = %self.serial, "device already in fastboot, rebooting bootloader anyway");
            let result = self.execute_fastboot_command(&["reboot-bootloader".to_string()])?;
            self.expect_success(result, "fastboot reboot-bootloader")?;
        } else {
            let result = self.adb(&["reboot", "bootloader"], self.options.command_timeout)?;
            self.expect_success(result, "adb reboot bootloader")?;
        }
        self.wait_for_bootloader(self.options.bootloader_timeout)
    }

    fn reboot(&self) -> Result<(), FlashError> {
        if self.is_in_fastboot()? {
            info!(serial = %self.serial, "device in fastboot, rebooting to userspace");
            let result = self.execute_fastboot_command(&["reboot".to_string()])?;
            self.expect_success(result, "fastboot reboot")?;
        } else {
            let result = self.adb(&["reboot"], self.options.command_timeout)?;
            self.expect_success(result, "adb reboot")?;
        }
        self.wait_for_device_online()
    }

    fn reboot_into_recovery(&self) -> Result<(), FlashError> {
        if self.is_in_fastboot()? {
            warn!(serial = %self.serial, "device in fastboot when requesting recovery");
            let result =
                self.execute_fastboot_command(&["reboot".to_string(), "recovery".to_string()])?;
            self.expect_success(result, "fastboot reboot recovery")?;
        } else {
            let result = self.adb(&["reboot", "recovery"], self.options.command_timeout)?;
            self.expect_success(result, "adb reboot recovery")?;
        }
        let result = self.adb(&["wait-for-recovery"], self.options.online_timeout)?;
        self.expect_success(result, "waiting for recovery")
    }

    fn wait_for_device_online(&self) -> Result<(), FlashError> {
        let result = self.adb(&["wait-for-device"], self.options.online_timeout)?;
        self.expect_success(result, "waiting for device online")
    }

    fn wait_for_device_available(&self, timeout: Duration) -> Result<(), FlashError> {
        let deadline = Instant::now() + timeout;
        let result = self.adb(&["wait-for-device"], timeout)?;
        self.expect_success(result, "waiting for device online")?;
        loop {
            if self.getprop("sys.boot_completed")?.as_deref() == Some("1") {
                debug!(serial = %self.serial, "device boot completed");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FlashError::unavailable(
                    &self.serial,
                    format!("device did not finish booting within {}s", timeout.as_secs()),
                ));
            }
            std::thread::sleep(self.options.poll_interval);
        }
    }

    fn execute_fastboot_command(&self, args: &[String]) -> Result<CommandResult, FlashError> {
        self.do_fastboot_command(self.options.command_timeout, args)
    }

    fn execute_long_fastboot_command(&self, args: &[String]) -> Result<CommandResult, FlashError> {
        self.do_fastboot_command(self.options.long_command_timeout, args)
    }

    fn execute_fastboot_command_with_timeout(
        &self,
        timeout: Duration,
        args: &[String],
    ) -> Result<CommandResult, FlashError> {
        self.do_fastboot_command(timeout, args)
    }

    fn product_type(&self) -> Result<Option<String>, FlashError> {
        let product = if self.is_in_fastboot()? {
            let result = self.execute_fastboot_command(&["getvar".to_string(), "product".to_string()])?;
            parse_fastboot_var(&result.combined_output(), "product")
        } else {
            self.getprop("ro.hardware")?
        };
        Ok(product.map(|value| value.to_lowercase()))
    }

    fn build_id(&self) -> Result<Option<String>, FlashError> {
        if self.is_in_fastboot()? {
            return Ok(None);
        }
        self.getprop("ro.build.version.incremental")
    }

    fn build_flavor(&self) -> Result<Option<String>, FlashError> {
        if self.is_in_fastboot()? {
            return Ok(None);
        }
        self.getprop("ro.build.flavor")
    }

    fn push_file(&self, local: &Path, remote: &str) -> Result<bool, FlashError> {
        let local = local.to_string_lossy().to_string();
        let result = self.adb(&["push", local.as_str(), remote], self.options.long_command_timeout)?;
        Ok(result.is_success())
    }

    fn push_dir(&self, local: &Path, remote: &str) -> Result<bool, FlashError> {
        self.push_file(local, remote)
    }

    fn sync_files(&self, local: &Path, remote: &str) -> Result<bool, FlashError> {
        let local = local.to_string_lossy().to_string();
        let result = self.adb(
            &["push", "--sync", local.as_str(), remote],
            self.options.long_command_timeout,
        )?;
        Ok(result.is_success())
    }

    fn does_file_exist(&self, remote: &str) -> Result<bool, FlashError> {
        let output = self.execute_shell_command(&format!("ls {}", shell_quote(remote)))?;
        Ok(!output.contains("No such file"))
    }

    fn execute_shell_command(&self, command: &str) -> Result<String, FlashError> {
        let result = self.adb(&["shell", command], self.options.command_timeout)?;
        if result.status == CommandStatus::TimedOut {
            return Err(FlashError::unavailable(
                &self.serial,
                format!("shell command '{command}' timed out"),
            ));
        }
        Ok(result.combined_output())
    }

    fn use_fastboot_erase(&self) -> bool {
        self.options.use_fastboot_erase
    }
}
