use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CleaningError, Result};
use crate::tracking;

pub const DEFAULT_TRACKING_CONFIG: &str = "tracking.toml";
pub const DEFAULT_TRACKING_DIR: &str = "wandb_local";
pub const DEFAULT_PROJECT: &str = "nyc_airbnb";
pub const JOB_TYPE: &str = "basic_cleaning";

/// A very basic data cleaning
#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "basic_cleaning")]
#[command(about = "A very basic data cleaning")]
#[command(version = "0.1.0")]
pub struct CleaningArgs {
    /// Fully qualified name for the artifact
    #[arg(long = "input_artifact")]
    pub input_artifact: String,

    /// Name for the artifact that will be created
    #[arg(long = "output_artifact")]
    pub output_artifact: String,

    /// Type of file for the artifact that will be created
    #[arg(long = "output_type")]
    pub output_type: String,

    /// Description for the artifact
    #[arg(long = "output_description")]
    pub output_description: String,

    /// Minimum price for outliers data
    #[arg(long = "min_price", allow_negative_numbers = true)]
    pub min_price: f64,

    /// Maximum price for outliers data
    #[arg(long = "max_price", allow_negative_numbers = true)]
    pub max_price: f64,

    /// Tracking store settings (TOML)
    #[arg(long = "tracking_config")]
    #[serde(skip)]
    pub tracking_config: Option<PathBuf>,
}

impl CleaningArgs {
    pub fn validate(&self) -> Result<()> {
        if !self.min_price.is_finite() || !self.max_price.is_finite() {
            return Err(CleaningError::Config(format!(
                "price bounds must be finite (min_price={}, max_price={})",
                self.min_price, self.max_price
            )));
        }
        if self.min_price > self.max_price {
            return Err(CleaningError::Config(format!(
                "min_price ({}) is greater than max_price ({})",
                self.min_price, self.max_price
            )));
        }
        for (flag, value) in [
            ("input_artifact", &self.input_artifact),
            ("output_artifact", &self.output_artifact),
            ("output_type", &self.output_type),
        ] {
            if value.trim().is_empty() {
                return Err(CleaningError::Config(format!("--{} must not be empty", flag)));
            }
        }
        if !tracking::is_valid_name(&self.output_artifact) {
            return Err(CleaningError::Config(format!(
                "--output_artifact '{}' is not a valid artifact name",
                self.output_artifact
            )));
        }
        Ok(())
    }

    /// Arguments echoed into the run config for provenance.
    pub fn to_run_config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackingConfig {
    pub root: PathBuf,
    pub project: String,
    pub group: Option<String>,
    pub remote: Option<RemoteConfig>,
    pub pushgateway_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    pub url: String,
    pub token: Option<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_TRACKING_DIR),
            project: DEFAULT_PROJECT.to_string(),
            group: None,
            remote: None,
            pushgateway_url: None,
        }
    }
}

impl TrackingConfig {
    /// Load settings from `path` (or `tracking.toml` if it exists), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_TRACKING_CONFIG).exists() => {
                Self::from_file(Path::new(DEFAULT_TRACKING_CONFIG))?
            }
            None => Self::default(),
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CleaningError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: TrackingConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_empty("TRACKING_DIR") {
            self.root = PathBuf::from(dir);
        }
        if let Some(project) = non_empty("TRACKING_PROJECT") {
            self.project = project;
        }
        if let Some(group) = non_empty("TRACKING_GROUP") {
            self.group = Some(group);
        }
        if let Some(url) = non_empty("TRACKING_REMOTE_URL") {
            let token = non_empty("TRACKING_REMOTE_TOKEN")
                .or_else(|| self.remote.as_ref().and_then(|r| r.token.clone()));
            self.remote = Some(RemoteConfig { url, token });
        }
        if let Some(url) = non_empty("CLEANING_PUSHGATEWAY_URL") {
            self.pushgateway_url = Some(url);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(min: f64, max: f64) -> CleaningArgs {
        CleaningArgs {
            input_artifact: "sample.csv:latest".to_string(),
            output_artifact: "clean_sample.csv".to_string(),
            output_type: "clean_sample".to_string(),
            output_description: "Data with outliers and null values removed".to_string(),
            min_price: min,
            max_price: max,
            tracking_config: None,
        }
    }

    #[test]
    fn test_parses_underscore_flags() {
        let parsed = CleaningArgs::try_parse_from([
            "basic_cleaning",
            "--input_artifact",
            "sample.csv:latest",
            "--output_artifact",
            "clean_sample.csv",
            "--output_type",
            "clean_sample",
            "--output_description",
            "cleaned",
            "--min_price",
            "10",
            "--max_price",
            "350",
        ])
        .unwrap();

        assert_eq!(parsed.input_artifact, "sample.csv:latest");
        assert_eq!(parsed.min_price, 10.0);
        assert_eq!(parsed.max_price, 350.0);
        assert!(parsed.tracking_config.is_none());
    }

    #[test]
    fn test_missing_required_flag_is_rejected() {
        let parsed = CleaningArgs::try_parse_from([
            "basic_cleaning",
            "--input_artifact",
            "sample.csv:latest",
            "--min_price",
            "10",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_bounds() {
        assert!(args(10.0, 350.0).validate().is_ok());
        assert!(args(50.0, 50.0).validate().is_ok());
        assert!(matches!(
            args(400.0, 350.0).validate(),
            Err(CleaningError::Config(_))
        ));
        assert!(matches!(
            args(f64::NAN, 350.0).validate(),
            Err(CleaningError::Config(_))
        ));
    }

    #[test]
    fn test_validate_output_name() {
        for bad in ["..", ".", "clean sample.csv", "out/clean.csv"] {
            let mut a = args(10.0, 350.0);
            a.output_artifact = bad.to_string();
            assert!(
                matches!(a.validate(), Err(CleaningError::Config(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_run_config_echoes_arguments() {
        let config = args(10.0, 350.0).to_run_config().unwrap();
        assert_eq!(config["input_artifact"], "sample.csv:latest");
        assert_eq!(config["min_price"], 10.0);
        assert!(config.get("tracking_config").is_none());
    }

    #[test]
    fn test_tracking_config_from_toml() {
        let config: TrackingConfig = toml::from_str(
            r#"
            root = "/tmp/store"
            project = "airbnb"

            [remote]
            url = "https://blobs.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/tmp/store"));
        assert_eq!(config.project, "airbnb");
        assert_eq!(config.group, None);
        assert_eq!(config.remote.unwrap().url, "https://blobs.example.com");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TRACKING_DIR", "/data/tracking"),
            ("TRACKING_GROUP", "cleaning"),
            ("TRACKING_REMOTE_URL", "https://blobs.example.com"),
            ("TRACKING_REMOTE_TOKEN", "secret"),
            ("TRACKING_PROJECT", "  "),
        ]
        .into_iter()
        .collect();

        let config = TrackingConfig::default()
            .with_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.root, PathBuf::from("/data/tracking"));
        assert_eq!(config.project, DEFAULT_PROJECT);
        assert_eq!(config.group.as_deref(), Some("cleaning"));
        let remote = config.remote.unwrap();
        assert_eq!(remote.token.as_deref(), Some("secret"));
    }
}
