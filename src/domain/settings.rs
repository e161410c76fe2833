use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// UART transport configuration (H4)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Baud rate used while the controller boots
    #[serde(default = "default_baud_rate_init")]
    pub baud_rate_init: u32,
    /// Baud rate after bring-up, if the controller supports switching
    #[serde(default)]
    pub baud_rate_main: Option<u32>,
    #[serde(default = "default_true")]
    pub flow_control: bool,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            baud_rate_init: default_baud_rate_init(),
            baud_rate_main: None,
            flow_control: default_true(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapSettings {
    #[serde(default = "default_local_name")]
    pub local_name: String,
    #[serde(default = "default_class_of_device")]
    pub class_of_device: u32,
    /// Inquiry length in units of 1.28 s
    #[serde(default = "default_inquiry_length")]
    pub inquiry_length: u8,
    /// 0 = unlimited
    #[serde(default)]
    pub inquiry_max_responses: u8,
}

impl Default for GapSettings {
    fn default() -> Self {
        Self {
            local_name: default_local_name(),
            class_of_device: default_class_of_device(),
            inquiry_length: default_inquiry_length(),
            inquiry_max_responses: 0,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bt_host_driver".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_device_name() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate_init() -> u32 {
    115_200
}
fn default_read_timeout_ms() -> u64 {
    20
}
fn default_local_name() -> String {
    "Rust Bluetooth Host".to_string()
}
fn default_class_of_device() -> u32 {
    // Phone, smartphone
    0x5A020C
}
fn default_inquiry_length() -> u8 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub gap: GapSettings,
}

pub struct SettingsService {
    settings: DriverSettings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BluetoothDriver");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<DriverSettings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut DriverSettings {
        &mut self.settings
    }
}
