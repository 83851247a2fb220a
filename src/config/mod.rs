use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 100;
pub const MIN_COLORS: u16 = 2;
pub const MAX_COLORS: u16 = 256;
pub const MAX_LOSSY_LEVEL: u8 = 10;
pub const MAX_DISPOSAL_METHOD: u8 = 3;
pub const MAX_DURATION_SECS: u32 = 300;
const MAX_FILENAME_TEMPLATE_LEN: usize = 128;
const MAX_POST_COMMAND_LEN: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub output: OutputConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub filename_template: String,
    /// Run after a completed recording; `{file}` expands to the gif path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_command: Option<String>,
}

/// Settings snapshot for one recording session. Checked with [`RecordingConfig::validate`]
/// before a session starts; values are never clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    pub fps: u32,
    pub scale_factor: f32,
    pub color_count: u16,
    pub dithering: bool,
    /// Keep every n-th captured frame.
    pub skip_value: u32,
    pub similarity_threshold: f32,
    pub similarity_skip: bool,
    /// Cursor refreshes once every `mouse_skip + 1` frames.
    pub mouse_skip: u32,
    pub lossy_level: u8,
    pub disposal_method: u8,
    pub show_cursor: bool,
    /// `None` records until stopped. Written to disk as `0`.
    #[serde(with = "duration_limit")]
    pub max_duration_secs: Option<u32>,
}

/// On-disk form of `max_duration_secs`, where `0` means no limit.
mod duration_limit {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(value.unwrap_or(0))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match u32::deserialize(deserializer)? {
            0 => None,
            secs => Some(secs),
        })
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            fps: 15,
            scale_factor: 1.0,
            color_count: 256,
            dithering: true,
            skip_value: 1,
            similarity_threshold: 0.95,
            similarity_skip: true,
            mouse_skip: 0,
            lossy_level: 0,
            disposal_method: 0,
            show_cursor: true,
            max_duration_secs: Some(30),
        }
    }
}

impl RecordingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fps < MIN_FPS || self.fps > MAX_FPS {
            return Err(ConfigError::out_of_range(
                "fps",
                "between 1 and 100",
                self.fps,
            ));
        }
        if !self.scale_factor.is_finite() || self.scale_factor <= 0.0 || self.scale_factor > 1.0 {
            return Err(ConfigError::out_of_range(
                "scale_factor",
                "greater than 0 and at most 1",
                self.scale_factor,
            ));
        }
        if self.color_count < MIN_COLORS || self.color_count > MAX_COLORS {
            return Err(ConfigError::out_of_range(
                "color_count",
                "between 2 and 256",
                self.color_count,
            ));
        }
        if self.skip_value < 1 {
            return Err(ConfigError::out_of_range(
                "skip_value",
                "at least 1",
                self.skip_value,
            ));
        }
        if !self.similarity_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.similarity_threshold)
        {
            return Err(ConfigError::out_of_range(
                "similarity_threshold",
                "between 0.0 and 1.0",
                self.similarity_threshold,
            ));
        }
        if self.lossy_level > MAX_LOSSY_LEVEL {
            return Err(ConfigError::out_of_range(
                "lossy_level",
                "between 0 and 10",
                self.lossy_level,
            ));
        }
        if self.disposal_method > MAX_DISPOSAL_METHOD {
            return Err(ConfigError::out_of_range(
                "disposal_method",
                "between 0 and 3",
                self.disposal_method,
            ));
        }
        if let Some(secs) = self.max_duration_secs {
            if secs == 0 || secs > MAX_DURATION_SECS {
                return Err(ConfigError::out_of_range(
                    "max_duration_secs",
                    "between 1 and 300",
                    secs,
                ));
            }
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }

    /// Display time of one capture tick, in milliseconds.
    pub fn tick_ms(&self) -> u32 {
        (1000.0 / f64::from(self.fps.max(1))).round() as u32
    }

    /// Number of ticks a duration-limited session captures.
    pub fn max_ticks(&self) -> Option<u64> {
        self.max_duration_secs
            .map(|secs| (f64::from(secs) * f64::from(self.fps)).ceil() as u64)
    }

    /// Palette size after lossy reduction, never below two.
    pub fn effective_color_count(&self) -> u16 {
        effective_color_count(self.color_count, self.lossy_level)
    }
}

pub fn effective_color_count(color_count: u16, lossy_level: u8) -> u16 {
    if lossy_level == 0 {
        return color_count;
    }
    let reduction = 1.0 - f64::from(lossy_level.min(MAX_LOSSY_LEVEL)) / 10.0;
    ((f64::from(color_count) * reduction) as u16).max(MIN_COLORS)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.recording.validate()?;
        let template = &self.output.filename_template;
        if template.len() > MAX_FILENAME_TEMPLATE_LEN {
            return Err(ConfigError::Invalid("filename_template too long".into()).into());
        }
        if template.contains('/') || template.contains('\\') || template.contains("..") {
            return Err(ConfigError::Invalid(
                "filename_template contains invalid path characters".into(),
            )
            .into());
        }
        if let Some(command) = &self.output.post_command {
            if command.len() > MAX_POST_COMMAND_LEN {
                return Err(ConfigError::Invalid("post_command too long".into()).into());
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let pictures_dir = directories::UserDirs::new()
            .and_then(|d| d.picture_dir().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| {
                directories::BaseDirs::new()
                    .map(|b| b.home_dir().to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."))
            });

        Self {
            output: OutputConfig {
                directory: pictures_dir.join("gifrec"),
                filename_template: "recording_%Y%m%d_%H%M%S".to_string(),
                post_command: None,
            },
            recording: RecordingConfig::default(),
        }
    }
}

impl Config {
    pub fn config_dir() -> Option<PathBuf> {
        ProjectDirs::from("com", "gifrec", "gifrec").map(|p| p.config_dir().to_path_buf())
    }

    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Loads the user config, falling back to defaults when none exists.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Config::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path().ok_or_else(|| anyhow!("No config directory available"))?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn ensure_output_dir(&self) -> Result<()> {
        let dir = &self.output.directory;
        if dir.as_os_str().is_empty() {
            return Err(anyhow!("Output directory path is empty"));
        }
        if dir.to_string_lossy().contains("..") {
            return Err(anyhow!("Output directory contains path traversal"));
        }
        fs::create_dir_all(dir)?;
        Ok(())
    }

    pub fn generate_filename(&self) -> String {
        let now = chrono::Local::now();
        let formatted = now.format(&self.output.filename_template).to_string();
        let sanitized: String = formatted
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .take(200)
            .collect();
        let safe_name = if sanitized.is_empty() {
            format!("recording_{}", now.timestamp())
        } else {
            sanitized
        };
        format!("{}.gif", safe_name)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output.directory.join(self.generate_filename())
    }

    /// Expands `post_command` for a finished recording.
    pub fn post_command_for(&self, file: &Path) -> Option<String> {
        self.output
            .post_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| c.replace("{file}", &file.to_string_lossy()))
    }
}
