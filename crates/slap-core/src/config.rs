//! Configuration management for slap-core
//!
//! All sections are optional in the TOML file. Missing keys take the values
//! shown here, except that effect lists default to empty.
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [debounce]
//! delay_ms = 500
//!
//! [ambient]
//! min_delay_ms = 2000
//! max_delay_ms = 6000
//! draw_when_capped = true
//!
//! [[ambient.slots]]
//! name = "horse"
//! trigger_probability = 5
//! exclusivity = "exclusive"
//! effects = ["horse1.mp3", "horse2.mp3"]
//!
//! [[ambient.slots]]
//! name = "whip"
//! trigger_probability = 25
//! exclusivity = "concurrent"
//! effects = ["whip1.wav"]
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ambient::{EffectId, Exclusivity};
use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, colored output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LogConfig,
    pub debounce: DebounceConfig,
    pub ambient: AmbientConfig,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(source).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(shown));
        }
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(shown.clone(), e.to_string()))?;
        let config = Self::from_toml_str(&source)?;
        info!(
            path = %shown,
            debounce_ms = config.debounce.delay_ms,
            slots = config.ambient.slots.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ambient.validate()
    }
}

/// Debounce validator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Quiet period after the last keystroke before a check runs (ms)
    pub delay_ms: u64,
}

impl DebounceConfig {
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { delay_ms: 500 }
    }
}

/// Ambient trigger scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbientConfig {
    /// Lower bound of the inter-cycle delay (ms, inclusive)
    pub min_delay_ms: u64,
    /// Upper bound of the inter-cycle delay (ms, inclusive)
    pub max_delay_ms: u64,
    /// Draw a percentage for an exclusive slot even when it is at capacity.
    /// Keeps the random sequence identical whether or not the slot is busy.
    pub draw_when_capped: bool,
    pub slots: Vec<SlotConfig>,
}

impl AmbientConfig {
    #[must_use]
    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    #[must_use]
    pub fn slot(&self, name: &str) -> Option<&SlotConfig> {
        self.slots.iter().find(|slot| slot.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(ConfigError::ValidationError(format!(
                "ambient.min_delay_ms ({}) exceeds ambient.max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }

        let mut seen = HashSet::new();
        for slot in &self.slots {
            if slot.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "ambient slot name must not be empty".to_string(),
                ));
            }
            if !seen.insert(slot.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate ambient slot: {}",
                    slot.name
                )));
            }
            if slot.trigger_probability > 100 {
                return Err(ConfigError::ValidationError(format!(
                    "ambient slot {}: trigger_probability {} is above 100",
                    slot.name, slot.trigger_probability
                )));
            }
        }
        Ok(())
    }
}

impl Default for AmbientConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 2000,
            max_delay_ms: 6000,
            draw_when_capped: true,
            slots: vec![
                SlotConfig::new("horse", 5, Exclusivity::Exclusive),
                SlotConfig::new("whip", 25, Exclusivity::Concurrent),
            ],
        }
    }
}

/// One category of ambient effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub name: String,
    /// Chance per cycle, in whole percent (0-100)
    pub trigger_probability: u8,
    pub exclusivity: Exclusivity,
    /// Concrete effects to pick from; an empty list makes the slot a no-op
    #[serde(default)]
    pub effects: Vec<EffectId>,
}

impl SlotConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, trigger_probability: u8, exclusivity: Exclusivity) -> Self {
        Self {
            name: name.into(),
            trigger_probability,
            exclusivity,
            effects: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_effects<I, E>(mut self, effects: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EffectId>,
    {
        self.effects = effects.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_client() {
        let config = Config::default();
        assert_eq!(config.debounce.delay(), Duration::from_millis(500));
        assert_eq!(
            config.ambient.delay_range(),
            (Duration::from_secs(2), Duration::from_secs(6))
        );
        assert!(config.ambient.draw_when_capped);

        let horse = config.ambient.slot("horse").unwrap();
        assert_eq!(horse.trigger_probability, 5);
        assert_eq!(horse.exclusivity, Exclusivity::Exclusive);
        let whip = config.ambient.slot("whip").unwrap();
        assert_eq!(whip.trigger_probability, 25);
        assert_eq!(whip.exclusivity, Exclusivity::Concurrent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = Config::from_toml_str("[debounce]\ndelay_ms = 250\n").unwrap();
        assert_eq!(config.debounce.delay_ms, 250);
        assert_eq!(config.ambient, AmbientConfig::default());
    }

    #[test]
    fn parses_custom_slots() {
        let source = r#"
            [ambient]
            min_delay_ms = 100
            max_delay_ms = 300
            draw_when_capped = false

            [[ambient.slots]]
            name = "horse"
            trigger_probability = 20
            exclusivity = "exclusive"
            effects = ["horse1.mp3", "horse2.mp3"]

            [[ambient.slots]]
            name = "whip"
            trigger_probability = 80
            exclusivity = "concurrent"
        "#;
        let config = Config::from_toml_str(source).unwrap();
        assert_eq!(config.ambient.min_delay_ms, 100);
        assert!(!config.ambient.draw_when_capped);
        let horse = config.ambient.slot("horse").unwrap();
        assert_eq!(horse.trigger_probability, 20);
        assert_eq!(
            horse.effects,
            vec![EffectId::from("horse1.mp3"), EffectId::from("horse2.mp3")]
        );
        assert!(config.ambient.slot("whip").unwrap().effects.is_empty());
    }

    #[test]
    fn rejects_inverted_delay_range() {
        let err = Config::from_toml_str("[ambient]\nmin_delay_ms = 7000\nmax_delay_ms = 6000\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref msg) if msg.contains("min_delay_ms")));
    }

    #[test]
    fn rejects_probability_above_100() {
        let mut config = AmbientConfig::default();
        config.slots[0].trigger_probability = 101;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("above 100"));
    }

    #[test]
    fn rejects_duplicate_and_empty_slot_names() {
        let mut config = AmbientConfig::default();
        config.slots[1].name = "horse".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));

        config.slots[1].name = "  ".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn rejects_unknown_exclusivity() {
        let source = r#"
            [[ambient.slots]]
            name = "horse"
            trigger_probability = 5
            exclusivity = "sometimes"
        "#;
        assert!(matches!(
            Config::from_toml_str(source),
            Err(ConfigError::ParseFailed(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("slap.toml");
        std::fs::write(&path, "[debounce]\ndelay_ms = 750\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.debounce.delay_ms, 750);
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn toml_output_parses_back() {
        let mut config = Config::default();
        config.ambient.slots[0] = SlotConfig::new("horse", 20, Exclusivity::Exclusive)
            .with_effects(["horse1.mp3"]);
        config.logging.format = LogFormat::Json;
        let text = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
