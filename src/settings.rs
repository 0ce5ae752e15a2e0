use anyhow::{bail, Context, Error};
use bson::{Bson, Document};
use config::{Config, ConfigError, Environment, File, Source};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Aggregate {
    pub collection: String,
    /// Path of a JSON file with the array of stages.
    pub pipeline: String,
    /// Command-level collation, as a JSON document.
    #[serde(default)]
    pub collation: Option<String>,
    #[serde(default)]
    pub explain: bool,
    #[serde(default = "enabled")]
    pub optimize: bool,
}

impl Aggregate {
    pub fn collation(&self) -> Result<Option<Document>, Error> {
        let Some(collation) = &self.collation else {
            return Ok(None);
        };

        let collation: serde_json::Value =
            serde_json::from_str(collation).with_context(|| format!("invalid aggregate.collation: {collation}"))?;
        match Bson::try_from(collation)? {
            Bson::Document(collation) => Ok(Some(collation)),
            collation => bail!("aggregate.collation must be an object, found {collation}"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Logging {
    #[serde(default = "info")]
    pub level: String,
    #[serde(default)]
    pub ansi: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: info(),
            ansi: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Mongo {
    pub url: String,
    pub database: String,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub aggregate: Aggregate,
    #[serde(default)]
    pub logging: Logging,
    pub mongo: Mongo,
}

impl Settings {
    pub fn from(path: &str) -> Result<Self, ConfigError> {
        Self::from_source(File::with_name(path))
    }

    fn from_source(source: impl Source + Send + Sync + 'static) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(source)
            .add_source(Environment::default().separator("_"))
            .build()?
            .try_deserialize()
    }
}

fn enabled() -> bool {
    true
}

fn info() -> String {
    "info".to_owned()
}
