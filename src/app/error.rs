use serde::Serialize;
use thiserror::Error;

/// Failure of a flashing session.
///
/// Every variant names the device so a failure can be triaged from the log line alone.
#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlashError {
    /// Configuration or artifact problem. Not retried by the flasher.
    #[error("setup error on device {serial}: {message}")]
    Setup { serial: String, message: String },

    /// The build itself looks faulty.
    #[error("build error on device {serial}: {message}")]
    Build { serial: String, message: String },

    /// The device stopped responding.
    #[error("device {serial} is unavailable: {message}")]
    DeviceUnavailable { serial: String, message: String },

    /// Host-level cancellation honoured at a safe point.
    #[error("flashing of device {serial} was interrupted: {message}")]
    Interrupted { serial: String, message: String },
}

impl FlashError {
    pub fn setup(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Setup {
            serial: serial.into(),
            message: message.into(),
        }
    }

    pub fn build(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Build {
            serial: serial.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            serial: serial.into(),
            message: message.into(),
        }
    }

    pub fn interrupted(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Interrupted {
            serial: serial.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "ERR_SETUP",
            Self::Build { .. } => "ERR_BUILD",
            Self::DeviceUnavailable { .. } => "ERR_DEVICE_UNAVAILABLE",
            Self::Interrupted { .. } => "ERR_INTERRUPTED",
        }
    }

    pub fn serial(&self) -> &str {
        match self {
            Self::Setup { serial, .. }
            | Self::Build { serial, .. }
            | Self::DeviceUnavailable { serial, .. }
            | Self::Interrupted { serial, .. } => serial,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Setup { message, .. }
            | Self::Build { message, .. }
            | Self::DeviceUnavailable { message, .. }
            | Self::Interrupted { message, .. } => message,
        }
    }

    pub fn is_device_unavailable(&self) -> bool {
        matches!(self, Self::DeviceUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_device_and_cause() {
        let err = FlashError::setup("HT7A1", "fastboot flash radio failed");
        assert_eq!(
            err.to_string(),
            "setup error on device HT7A1: fastboot flash radio failed"
        );
        assert_eq!(err.code(), "ERR_SETUP");
        assert_eq!(err.serial(), "HT7A1");
    }

    #[test]
    fn serializes_with_kind_tag() {
        let err = FlashError::unavailable("HT7A1", "no response");
        let value = serde_json::to_value(&err).expect("serialize");
        assert_eq!(value["kind"], "device_unavailable");
        assert_eq!(value["serial"], "HT7A1");
        assert!(err.is_device_unavailable());
    }
}
