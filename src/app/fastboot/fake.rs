//! Scripted in-memory device used by flasher tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::app::error::FlashError;
use crate::app::fastboot::controller::DeviceController;
use crate::app::models::CommandResult;
use crate::app::scheduler::FlashPermitCoordinator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    RebootBootloader,
    Reboot,
    RebootRecovery,
    WaitOnline,
    WaitAvailable,
    Fastboot(Vec<String>),
    Shell(String),
    Push { local: String, remote: String },
    Sync { local: String, remote: String },
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub calls: Vec<FakeCall>,
    pub vars: HashMap<String, String>,
    pub unparsable_vars: HashSet<String>,
    pub partitions: HashSet<String>,
    pub failing_partitions: HashSet<String>,
    pub product_type: Option<String>,
    pub build_id: Option<String>,
    pub build_flavor: Option<String>,
    pub build_after_update: Option<(String, String)>,
    pub data_entries: BTreeSet<String>,
    pub stuck_entries: HashSet<String>,
    pub unresponsive: bool,
    pub unresponsive_on: Option<String>,
    /// Free flashing permits seen at each call, when permits are watched.
    pub permits_free: Vec<(FakeCall, usize)>,
}

pub struct FakeDevice {
    serial: String,
    use_erase: bool,
    permits: Option<Arc<FlashPermitCoordinator>>,
    state: Mutex<FakeState>,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            use_erase: false,
            permits: None,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn configure(self, f: impl FnOnce(&mut FakeState)) -> Self {
        f(&mut self.state());
        self
    }

    pub fn with_erase(mut self) -> Self {
        self.use_erase = true;
        self
    }

    pub fn watch_permits(mut self, permits: Arc<FlashPermitCoordinator>) -> Self {
        self.permits = Some(permits);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state")
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    pub fn fastboot_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Fastboot(args) => Some(args),
                _ => None,
            })
            .collect()
    }

    /// fastboot commands that write a partition.
    pub fn flash_calls(&self) -> Vec<Vec<String>> {
        self.fastboot_calls()
            .into_iter()
            .filter(|args| {
                args.iter()
                    .any(|arg| arg == "flash" || arg == "update")
            })
            .collect()
    }

    fn check_responsive(&self, state: &FakeState) -> Result<(), FlashError> {
        if state.unresponsive {
            return Err(FlashError::unavailable(&self.serial, "device not responding"));
        }
        Ok(())
    }

    fn record(&self, call: FakeCall) -> Result<MutexGuard<'_, FakeState>, FlashError> {
        let mut state = self.state();
        self.check_responsive(&state)?;
        if let Some(permits) = &self.permits {
            state
                .permits_free
                .push((call.clone(), permits.available_permits()));
        }
        state.calls.push(call);
        Ok(state)
    }

    fn fastboot(&self, args: &[String]) -> Result<CommandResult, FlashError> {
        let mut state = self.record(FakeCall::Fastboot(args.to_vec()))?;
        let positional = args
            .iter()
            .filter(|arg| !arg.starts_with("--"))
            .map(|arg| arg.as_str())
            .collect::<Vec<_>>();
        let command = positional.first().copied().unwrap_or_default();
        if state.unresponsive_on.as_deref() == Some(command) {
            state.unresponsive = true;
            return Err(FlashError::unavailable(&self.serial, "device dropped off the bus"));
        }
        let result = match command {
            "getvar" => {
                let name = positional.get(1).copied().unwrap_or_default();
                if state.unparsable_vars.contains(name) {
                    CommandResult::success("", "<garbled response>\n")
                } else if let Some(partition) = name.strip_prefix("partition-type:") {
                    if state.partitions.contains(partition) {
                        CommandResult::success("", format!("{name}: ext4\nFinished.\n"))
                    } else {
                        CommandResult::success(
                            "",
                            format!("getvar:{name} FAILED (remote: 'Variable not implemented')\n"),
                        )
                    }
                } else if let Some(value) = state.vars.get(name) {
                    CommandResult::success("", format!("{name}: {value}\nFinished.\n"))
                } else {
                    CommandResult::success("", format!("{name}: \nFinished.\n"))
                }
            }
            "flash" => {
                let partition = positional.get(1).copied().unwrap_or_default();
                if state.failing_partitions.contains(partition) {
                    CommandResult::success("", "Sending...\nFAILED (remote: 'flash write failure')\n")
                } else {
                    CommandResult::success("", "OKAY\n")
                }
            }
            "update" => {
                if let Some((build_id, flavor)) = state.build_after_update.clone() {
                    state.build_id = Some(build_id);
                    state.build_flavor = Some(flavor);
                }
                CommandResult::success("", "OKAY\n")
            }
            _ => CommandResult::success("", "OKAY\n"),
        };
        Ok(result)
    }
}

impl DeviceController for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn reboot_into_bootloader(&self) -> Result<(), FlashError> {
        self.record(FakeCall::RebootBootloader).map(|_| ())
    }

    fn reboot(&self) -> Result<(), FlashError> {
        self.record(FakeCall::Reboot).map(|_| ())
    }

    fn reboot_into_recovery(&self) -> Result<(), FlashError> {
        self.record(FakeCall::RebootRecovery).map(|_| ())
    }

    fn wait_for_device_online(&self) -> Result<(), FlashError> {
        self.record(FakeCall::WaitOnline).map(|_| ())
    }

    fn wait_for_device_available(&self, _timeout: Duration) -> Result<(), FlashError> {
        self.record(FakeCall::WaitAvailable).map(|_| ())
    }

    fn execute_fastboot_command(&self, args: &[String]) -> Result<CommandResult, FlashError> {
        self.fastboot(args)
    }

    fn execute_long_fastboot_command(&self, args: &[String]) -> Result<CommandResult, FlashError> {
        self.fastboot(args)
    }

    fn execute_fastboot_command_with_timeout(
        &self,
        _timeout: Duration,
        args: &[String],
    ) -> Result<CommandResult, FlashError> {
        self.fastboot(args)
    }

    fn product_type(&self) -> Result<Option<String>, FlashError> {
        let state = self.state();
        self.check_responsive(&state)?;
        Ok(state.product_type.clone())
    }

    fn build_id(&self) -> Result<Option<String>, FlashError> {
        let state = self.state();
        self.check_responsive(&state)?;
        Ok(state.build_id.clone())
    }

    fn build_flavor(&self) -> Result<Option<String>, FlashError> {
        let state = self.state();
        self.check_responsive(&state)?;
        Ok(state.build_flavor.clone())
    }

    fn push_file(&self, local: &Path, remote: &str) -> Result<bool, FlashError> {
        self.record(FakeCall::Push {
            local: local.display().to_string(),
            remote: remote.to_string(),
        })
        .map(|_| true)
    }

    fn push_dir(&self, local: &Path, remote: &str) -> Result<bool, FlashError> {
        self.push_file(local, remote)
    }

    fn sync_files(&self, local: &Path, remote: &str) -> Result<bool, FlashError> {
        let mut state = self.record(FakeCall::Sync {
            local: local.display().to_string(),
            remote: remote.to_string(),
        })?;
        if remote.trim_end_matches('/') == "/data" {
            if let Some(name) = local.file_name() {
                state.data_entries.insert(name.to_string_lossy().to_string());
            }
        }
        Ok(true)
    }

    fn does_file_exist(&self, remote: &str) -> Result<bool, FlashError> {
        let state = self.state();
        self.check_responsive(&state)?;
        Ok(remote
            .strip_prefix("/data/")
            .is_some_and(|name| state.data_entries.contains(name)))
    }

    fn execute_shell_command(&self, command: &str) -> Result<String, FlashError> {
        let mut state = self.record(FakeCall::Shell(command.to_string()))?;
        if command.trim() == "ls -1 /data" {
            return Ok(state
                .data_entries
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n"));
        }
        if let Some(path) = command.strip_prefix("rm -r ") {
            let name = path
                .trim()
                .trim_matches('\'')
                .trim_start_matches("/data/")
                .to_string();
            if state.stuck_entries.contains(&name) {
                return Ok(format!("rm: {path}: Device or resource busy"));
            }
            state.data_entries.remove(&name);
        }
        Ok(String::new())
    }

    fn use_fastboot_erase(&self) -> bool {
        self.use_erase
    }
}
