use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::app::fastboot::HostControllerOptions;
use crate::app::flasher::FlashOptions;
use crate::app::models::UserDataFlashOption;
use crate::app::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("failed to write config {path}: {reason}")]
    Write { path: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlashSettings {
    pub userdata_flash: UserDataFlashOption,
    pub force_system_flash: bool,
    pub wipe_skip_list: Vec<String>,
    pub wipe_timeout_secs: u64,
    pub fastboot_flash_options: Vec<String>,
    pub skip_post_flash_setup: bool,
    pub device_boot_timeout_secs: u64,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            userdata_flash: UserDataFlashOption::Flash,
            force_system_flash: false,
            wipe_skip_list: vec!["media".to_string()],
            wipe_timeout_secs: 4 * 60,
            fastboot_flash_options: Vec::new(),
            skip_post_flash_setup: false,
            device_boot_timeout_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostSettings {
    pub adb_path: String,
    pub fastboot_path: String,
    /// `None` lets every device flash at once.
    pub concurrent_flasher_limit: Option<usize>,
    pub command_timeout_secs: u64,
    pub long_command_timeout_secs: u64,
    pub online_timeout_secs: u64,
    pub bootloader_timeout_secs: u64,
    pub use_fastboot_erase: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            adb_path: String::new(),
            fastboot_path: String::new(),
            concurrent_flasher_limit: None,
            command_timeout_secs: 60,
            long_command_timeout_secs: 25 * 60,
            online_timeout_secs: 5 * 60,
            bootloader_timeout_secs: 60,
            use_fastboot_erase: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub version_query_attempts: u32,
    pub version_query_base_delay_ms: u64,
    pub data_delete_attempts: u32,
    pub data_delete_base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            version_query_attempts: 3,
            version_query_base_delay_ms: 2_000,
            data_delete_attempts: 3,
            data_delete_base_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlasherConfig {
    #[serde(default)]
    pub flash: FlashSettings,
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub version: String,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            flash: FlashSettings::default(),
            host: HostSettings::default(),
            retry: RetrySettings::default(),
            logging: LoggingSettings::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl FlasherConfig {
    pub fn flash_options(&self) -> FlashOptions {
        FlashOptions {
            userdata_flash_option: self.flash.userdata_flash,
            force_system_flash: self.flash.force_system_flash,
            data_wipe_skip_list: self.flash.wipe_skip_list.clone(),
            wipe_timeout: Duration::from_secs(self.flash.wipe_timeout_secs),
            fastboot_flash_extra_options: self.flash.fastboot_flash_options.clone(),
            skip_post_flash_setup: self.flash.skip_post_flash_setup,
            device_boot_timeout: Duration::from_secs(self.flash.device_boot_timeout_secs),
            version_query_retry: RetryPolicy::jittered(
                self.retry.version_query_attempts,
                Duration::from_millis(self.retry.version_query_base_delay_ms),
            ),
            data_delete_retry: RetryPolicy::quadratic(
                self.retry.data_delete_attempts,
                Duration::from_millis(self.retry.data_delete_base_delay_ms),
            ),
        }
    }

    /// Program paths must already be resolved by the caller.
    pub fn host_options(&self, adb_program: String, fastboot_program: String) -> HostControllerOptions {
        HostControllerOptions {
            adb_program,
            fastboot_program,
            command_timeout: Duration::from_secs(self.host.command_timeout_secs),
            long_command_timeout: Duration::from_secs(self.host.long_command_timeout_secs),
            online_timeout: Duration::from_secs(self.host.online_timeout_secs),
            bootloader_timeout: Duration::from_secs(self.host.bootloader_timeout_secs),
            use_fastboot_erase: self.host.use_fastboot_erase,
            ..HostControllerOptions::default()
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FASTBOOT_FLASHER_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fastboot_flasher_config.json")
}

pub fn load_config() -> Result<FlasherConfig, ConfigError> {
    load_config_from_path(&config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<FlasherConfig, ConfigError> {
    if !path.exists() {
        return Ok(FlasherConfig::default());
    }
    let raw = fs::read_to_string(path).map_err(|err| ConfigError::Read {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|err| ConfigError::Parse {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    let config: FlasherConfig =
        serde_json::from_value(value.clone()).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
    Ok(validate_config(apply_legacy_overrides(config, &value)))
}

pub fn save_config_to_path(config: &FlasherConfig, path: &Path) -> Result<(), ConfigError> {
    let write_error = |reason: String| ConfigError::Write {
        path: path.display().to_string(),
        reason,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| write_error(err.to_string()))?;
    }
    let payload =
        serde_json::to_string_pretty(config).map_err(|err| write_error(err.to_string()))?;
    fs::write(path, payload).map_err(|err| write_error(err.to_string()))
}

fn string_list(value: &serde_json::Value) -> Option<Vec<String>> {
    if let Some(raw) = value.as_str() {
        return Some(
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        );
    }
    value.as_array().map(|items| {
        items
            .iter()
            .filter_map(|item| item.as_str().map(|s| s.to_string()))
            .collect()
    })
}

/// Flat dashed keys, as written by older host configs, win over sections.
pub fn apply_legacy_overrides(mut config: FlasherConfig, value: &serde_json::Value) -> FlasherConfig {
    if let Some(option) = value
        .get("userdata-flash")
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse::<UserDataFlashOption>().ok())
    {
        config.flash.userdata_flash = option;
    }
    if let Some(force) = value.get("force-system-flash").and_then(|v| v.as_bool()) {
        config.flash.force_system_flash = force;
    }
    if let Some(skip) = value.get("wipe-skip-list").and_then(string_list) {
        config.flash.wipe_skip_list = skip;
    }
    if let Some(timeout) = value.get("wipe-timeout").and_then(|v| v.as_u64()) {
        config.flash.wipe_timeout_secs = timeout;
    }
    if let Some(options) = value.get("fastboot-flash-option").and_then(string_list) {
        config.flash.fastboot_flash_options = options;
    }
    if let Some(limit) = value.get("concurrent-flasher-limit") {
        if limit.is_null() {
            config.host.concurrent_flasher_limit = None;
        } else if let Some(limit) = limit.as_u64() {
            config.host.concurrent_flasher_limit = Some(limit as usize);
        }
    }
    config
}

pub fn validate_config(mut config: FlasherConfig) -> FlasherConfig {
    if config.flash.wipe_timeout_secs == 0 {
        config.flash.wipe_timeout_secs = 4 * 60;
    }
    if config.flash.device_boot_timeout_secs == 0 {
        config.flash.device_boot_timeout_secs = 5 * 60;
    }
    if config.flash.wipe_skip_list.iter().all(|entry| entry.trim().is_empty()) {
        config.flash.wipe_skip_list = vec!["media".to_string()];
    }
    if config.host.concurrent_flasher_limit == Some(0) {
        config.host.concurrent_flasher_limit = Some(1);
    }
    if config.host.command_timeout_secs == 0 {
        config.host.command_timeout_secs = 60;
    }
    if config.host.long_command_timeout_secs < config.host.command_timeout_secs {
        config.host.long_command_timeout_secs = 25 * 60;
    }
    if config.host.online_timeout_secs == 0 {
        config.host.online_timeout_secs = 5 * 60;
    }
    if config.host.bootloader_timeout_secs == 0 {
        config.host.bootloader_timeout_secs = 60;
    }
    if !(1..=10).contains(&config.retry.version_query_attempts) {
        config.retry.version_query_attempts = 3;
    }
    if !(1..=10).contains(&config.retry.data_delete_attempts) {
        config.retry.data_delete_attempts = 3;
    }
    if config.retry.version_query_base_delay_ms > 60_000 {
        config.retry.version_query_base_delay_ms = 2_000;
    }
    if config.retry.data_delete_base_delay_ms > 60_000 {
        config.retry.data_delete_base_delay_ms = 1_000;
    }
    if config.logging.log_level.trim().is_empty() {
        config.logging.log_level = "info".to_string();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_legacy_values() {
        let value = serde_json::json!({
            "flash": { "userdata_flash": "WIPE", "wipe_timeout_secs": 30 },
            "userdata-flash": "tests-zip",
            "force-system-flash": true,
            "wipe-skip-list": "media, local",
            "fastboot-flash-option": ["--skip-secondary"],
            "concurrent-flasher-limit": 2
        });
        let config: FlasherConfig = serde_json::from_value(value.clone()).expect("config");
        let config = apply_legacy_overrides(config, &value);
        assert_eq!(config.flash.userdata_flash, UserDataFlashOption::TestsZip);
        assert!(config.flash.force_system_flash);
        assert_eq!(config.flash.wipe_skip_list, vec!["media", "local"]);
        assert_eq!(config.flash.wipe_timeout_secs, 30);
        assert_eq!(config.flash.fastboot_flash_options, vec!["--skip-secondary"]);
        assert_eq!(config.host.concurrent_flasher_limit, Some(2));
    }

    #[test]
    fn null_limit_means_unlimited() {
        let value = serde_json::json!({
            "host": { "concurrent_flasher_limit": 4 },
            "concurrent-flasher-limit": null
        });
        let config: FlasherConfig = serde_json::from_value(value.clone()).expect("config");
        assert_eq!(
            apply_legacy_overrides(config, &value).host.concurrent_flasher_limit,
            None
        );
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = FlasherConfig::default();
        config.flash.wipe_timeout_secs = 0;
        config.flash.wipe_skip_list = vec![" ".to_string()];
        config.host.concurrent_flasher_limit = Some(0);
        config.host.long_command_timeout_secs = 1;
        config.retry.version_query_attempts = 0;
        config.logging.log_level = String::new();
        let validated = validate_config(config);
        assert_eq!(validated.flash.wipe_timeout_secs, 240);
        assert_eq!(validated.flash.wipe_skip_list, vec!["media"]);
        assert_eq!(validated.host.concurrent_flasher_limit, Some(1));
        assert_eq!(validated.host.long_command_timeout_secs, 1500);
        assert_eq!(validated.retry.version_query_attempts, 3);
        assert_eq!(validated.logging.log_level, "info");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from_path(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config, FlasherConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let mut config = FlasherConfig::default();
        config.flash.userdata_flash = UserDataFlashOption::WipeRm;
        config.host.concurrent_flasher_limit = Some(3);
        save_config_to_path(&config, &path).expect("save");
        assert_eq!(load_config_from_path(&path).expect("load"), config);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            load_config_from_path(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn converts_into_flash_options() {
        let mut config = FlasherConfig::default();
        config.flash.wipe_skip_list = vec!["media".to_string(), "misc".to_string()];
        config.retry.data_delete_attempts = 5;
        let options = config.flash_options();
        assert_eq!(options.data_wipe_skip_list, vec!["media", "misc"]);
        assert_eq!(options.wipe_timeout, Duration::from_secs(240));
        assert_eq!(options.data_delete_retry.max_attempts, 5);

        let host = config.host_options("adb".to_string(), "fastboot".to_string());
        assert_eq!(host.long_command_timeout, Duration::from_secs(1500));
    }
}
