use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::app::models::{
    BuildArtifact, CommandStatus, DeviceImage, SystemFlashStatus, UserDataFlashOption,
};
use crate::app::requirements::RequirementMap;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FlashStage {
    Started,
    BootloaderMode,
    ResourcesResolved,
    BootloaderChecked,
    BasebandChecked,
    UserdataHandled,
    ExtraImagesFlashed,
    SystemChecked,
    Online,
}

/// State of one `flash` call, threaded through every step.
#[derive(Debug)]
pub struct FlashSession<'a> {
    pub serial: String,
    pub trace_id: String,
    pub build: &'a BuildArtifact,
    pub option: UserDataFlashOption,
    pub stage: FlashStage,
    pub requirements: Option<RequirementMap>,
    pub product_type: Option<String>,
    /// Build running on the device before it entered the bootloader.
    pub current_build_id: Option<String>,
    pub current_build_flavor: Option<String>,
    /// Images to check against the device, from the build or the resource provider.
    pub bootloader: Option<DeviceImage>,
    pub baseband: Option<DeviceImage>,
    pub last_command_status: Option<CommandStatus>,
    pub system_flash_status: SystemFlashStatus,
    pub bootloader_flashed: bool,
    pub baseband_flashed: bool,
    pub flashed_partitions: Vec<String>,
    pub queue_wait: Duration,
    pub flash_duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl<'a> FlashSession<'a> {
    pub fn new(
        serial: impl Into<String>,
        trace_id: impl Into<String>,
        build: &'a BuildArtifact,
        option: UserDataFlashOption,
    ) -> Self {
        Self {
            serial: serial.into(),
            trace_id: trace_id.into(),
            build,
            option,
            stage: FlashStage::Started,
            requirements: None,
            product_type: None,
            current_build_id: None,
            current_build_flavor: None,
            bootloader: None,
            baseband: None,
            last_command_status: None,
            system_flash_status: SystemFlashStatus::NotAttempted,
            bootloader_flashed: false,
            baseband_flashed: false,
            flashed_partitions: Vec::new(),
            queue_wait: Duration::ZERO,
            flash_duration: Duration::ZERO,
            started_at: Utc::now(),
        }
    }

    pub fn advance(&mut self, stage: FlashStage) {
        debug!(
            trace_id = %self.trace_id,
            serial = %self.serial,
            from = ?self.stage,
            to = ?stage,
            "flash stage transition"
        );
        self.stage = stage;
    }

    pub fn report(&self) -> FlashReport {
        FlashReport {
            serial: self.serial.clone(),
            trace_id: self.trace_id.clone(),
            build_id: self.build.build_id.clone(),
            build_flavor: self.build.build_flavor.clone(),
            userdata_flash_option: self.option,
            product_type: self.product_type.clone(),
            bootloader_flashed: self.bootloader_flashed,
            baseband_flashed: self.baseband_flashed,
            system_flash_status: self.system_flash_status,
            partitions_flashed: self.flashed_partitions.clone(),
            final_stage: self.stage,
            queue_wait_ms: self.queue_wait.as_millis() as u64,
            flash_duration_ms: self.flash_duration.as_millis() as u64,
            started_at: self.started_at.to_rfc3339(),
        }
    }
}

/// Summary of a completed flash, suitable for metrics and JSON output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FlashReport {
    pub serial: String,
    pub trace_id: String,
    pub build_id: String,
    pub build_flavor: String,
    pub userdata_flash_option: UserDataFlashOption,
    pub product_type: Option<String>,
    pub bootloader_flashed: bool,
    pub baseband_flashed: bool,
    pub system_flash_status: SystemFlashStatus,
    pub partitions_flashed: Vec<String>,
    pub final_stage: FlashStage,
    pub queue_wait_ms: u64,
    pub flash_duration_ms: u64,
    pub started_at: String,
}
