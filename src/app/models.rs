use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How the userdata partition is handled during a flash.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserDataFlashOption {
    #[default]
    Flash,
    FlashImgZip,
    Wipe,
    ForceWipe,
    WipeRm,
    TestsZip,
    Retain,
}

impl UserDataFlashOption {
    pub const ALL: [UserDataFlashOption; 7] = [
        Self::Flash,
        Self::FlashImgZip,
        Self::Wipe,
        Self::ForceWipe,
        Self::WipeRm,
        Self::TestsZip,
        Self::Retain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flash => "FLASH",
            Self::FlashImgZip => "FLASH_IMG_ZIP",
            Self::Wipe => "WIPE",
            Self::ForceWipe => "FORCE_WIPE",
            Self::WipeRm => "WIPE_RM",
            Self::TestsZip => "TESTS_ZIP",
            Self::Retain => "RETAIN",
        }
    }
}

impl fmt::Display for UserDataFlashOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserDataFlashOption {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|option| option.as_str() == normalized)
            .ok_or_else(|| format!("unknown userdata flash option '{}'", value.trim()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Failed,
    TimedOut,
    Exception,
}

/// Output of one host command (adb or fastboot).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandResult {
    pub fn success(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Success,
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(0),
        }
    }

    pub fn failed(stderr: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            status: CommandStatus::Failed,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: CommandStatus::TimedOut,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    /// fastboot writes most of its chatter to stderr, so both streams are searched.
    pub fn combined_output(&self) -> String {
        if self.stdout.trim().is_empty() {
            self.stderr.clone()
        } else if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stderr, self.stdout)
        }
    }
}

/// Terminal outcome of the system image step, reported for metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemFlashStatus {
    Success,
    Failed,
    #[default]
    NotAttempted,
}

impl From<CommandStatus> for SystemFlashStatus {
    fn from(status: CommandStatus) -> Self {
        match status {
            CommandStatus::Success => Self::Success,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceImage {
    pub path: PathBuf,
    pub version: String,
}

impl DeviceImage {
    pub fn new(path: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
        }
    }
}

/// Immutable description of the build to put on the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildArtifact {
    pub build_id: String,
    pub build_flavor: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Full device image archive, flashed with `fastboot update`.
    pub device_image_zip: PathBuf,
    #[serde(default)]
    pub userdata_image: Option<PathBuf>,
    #[serde(default)]
    pub bootloader: Option<DeviceImage>,
    #[serde(default)]
    pub baseband: Option<DeviceImage>,
    #[serde(default)]
    pub ota_package: Option<PathBuf>,
    #[serde(default)]
    pub tests_zip: Option<PathBuf>,
    /// Vendor partitions keyed by partition name.
    #[serde(default)]
    pub extra_images: BTreeMap<String, PathBuf>,
}

impl BuildArtifact {
    pub fn new(
        build_id: impl Into<String>,
        build_flavor: impl Into<String>,
        device_image_zip: impl Into<PathBuf>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            build_flavor: build_flavor.into(),
            branch: None,
            device_image_zip: device_image_zip.into(),
            userdata_image: None,
            bootloader: None,
            baseband: None,
            ota_package: None,
            tests_zip: None,
            extra_images: BTreeMap::new(),
        }
    }

    pub fn with_userdata_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.userdata_image = Some(path.into());
        self
    }

    pub fn with_bootloader(mut self, image: DeviceImage) -> Self {
        self.bootloader = Some(image);
        self
    }

    pub fn with_baseband(mut self, image: DeviceImage) -> Self {
        self.baseband = Some(image);
        self
    }

    pub fn with_tests_zip(mut self, path: impl Into<PathBuf>) -> Self {
        self.tests_zip = Some(path.into());
        self
    }

    pub fn with_extra_image(mut self, partition: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.extra_images.insert(partition.into(), path.into());
        self
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("Failed to read build description {}: {err}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|err| format!("Failed to parse build description {}: {err}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_userdata_option_loosely() {
        assert_eq!(
            "wipe-rm".parse::<UserDataFlashOption>().unwrap(),
            UserDataFlashOption::WipeRm
        );
        assert_eq!(
            " FLASH_IMG_ZIP ".parse::<UserDataFlashOption>().unwrap(),
            UserDataFlashOption::FlashImgZip
        );
        assert!("nuke".parse::<UserDataFlashOption>().is_err());
    }

    #[test]
    fn combined_output_prefers_the_non_empty_stream() {
        let result = CommandResult::success("", "version-bootloader: abc\n");
        assert_eq!(result.combined_output(), "version-bootloader: abc\n");
        let result = CommandResult::success("out", "err");
        assert_eq!(result.combined_output(), "err\nout");
    }

    #[test]
    fn build_artifact_deserializes_with_defaults() {
        let value = serde_json::json!({
            "build_id": "ABC123",
            "build_flavor": "walleye-userdebug",
            "device_image_zip": "/builds/walleye-img-ABC123.zip",
            "bootloader": { "path": "/builds/bootloader.img", "version": "mw8998-002.0069.00" }
        });
        let build: BuildArtifact = serde_json::from_value(value).expect("parse");
        assert_eq!(build.build_id, "ABC123");
        assert!(build.userdata_image.is_none());
        assert_eq!(build.bootloader.unwrap().version, "mw8998-002.0069.00");
        assert!(build.extra_images.is_empty());
    }
}
