//! Library configuration, loadable from TOML.
//!
//! ```toml
//! access_layer = "memory"
//! numbering = "logical"
//! release_on_close = true
//! board = "rpi4b"
//! ```
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::device::error::ConfigError;
use crate::gpio::AccessLayer;
use crate::pin::Numbering;
use crate::{GpioError, GpioResult};

/// Realtime priority requested for software PWM generator threads.
pub const DEFAULT_SOFT_PWM_PRIORITY: i32 = 50;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GpioConfig {
    /// How pins reach the hardware. `Auto` prefers memory-mapped registers.
    pub access_layer: AccessLayer,
    /// Scheme used by `Gpio::pin`.
    pub numbering: Numbering,
    /// Restore every pin's original mode and pull when it is closed.
    pub release_on_close: bool,
    /// Trace register writes.
    pub debug: bool,
    /// Consumer label shown by the kernel for requested lines.
    pub consumer: String,
    /// SCHED_FIFO priority of software PWM threads.
    pub soft_pwm_priority: i32,
    /// Board id to use instead of device-tree detection.
    pub board: Option<String>,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            access_layer: AccessLayer::Auto,
            numbering: Numbering::Logical,
            release_on_close: false,
            debug: false,
            consumer: env!("CARGO_PKG_NAME").to_string(),
            soft_pwm_priority: DEFAULT_SOFT_PWM_PRIORITY,
            board: None,
        }
    }
}

impl GpioConfig {
    pub fn from_toml_str(text: &str) -> GpioResult<Self> {
        toml::from_str(text).map_err(|err| GpioError::ConfigError(ConfigError::Parse(err)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> GpioResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| GpioError::ConfigError(ConfigError::Read(path.display().to_string(), err)))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        assert_eq!(GpioConfig::from_toml_str("").unwrap(), GpioConfig::default());
    }

    #[test]
    fn fields_override_defaults() {
        let config = GpioConfig::from_toml_str(
            r#"
            access_layer = "chardev"
            numbering = "physical"
            release_on_close = true
            board = "nanopi-neo"
            "#,
        )
        .unwrap();

        assert_eq!(config.access_layer, AccessLayer::CharDev);
        assert_eq!(config.numbering, Numbering::Physical);
        assert!(config.release_on_close);
        assert_eq!(config.board.as_deref(), Some("nanopi-neo"));
        assert_eq!(config.soft_pwm_priority, DEFAULT_SOFT_PWM_PRIORITY);
    }

    #[test]
    fn unknown_layer_is_a_parse_error() {
        assert!(matches!(
            GpioConfig::from_toml_str("access_layer = \"sysfs\""),
            Err(GpioError::ConfigError(ConfigError::Parse(_)))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        assert!(matches!(
            GpioConfig::load("/nonexistent/sbc-gpio.toml"),
            Err(GpioError::ConfigError(ConfigError::Read(..)))
        ));
    }
}
