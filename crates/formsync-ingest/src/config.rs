//! Configuration management
//!
//! Everything except the form definitions comes from `FORMSYNC_*`
//! environment variables (a `.env` file is honoured). Form definitions live
//! in the YAML file named by `FORMSYNC_FORMS_FILE`. The whole configuration is
//! validated once, before anything is fetched.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::fetch::{ona, surveycto, OnaConfig, SurveyCtoConfig};
use crate::registry::SchemaRegistry;
use crate::sink::{postgres, SinkKind};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default maximum PostgreSQL connections in the pool
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default MongoDB database name
pub const DEFAULT_MONGO_DATABASE: &str = "formsync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    SurveyCto,
    Ona,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "surveycto" | "scto" => Ok(SourceKind::SurveyCto),
            "ona" => Ok(SourceKind::Ona),
            other => Err(ConfigError::invalid(
                "FORMSYNC_SOURCE",
                format!("unknown source '{}', expected surveycto or ona", other),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SourceConfig {
    SurveyCto(SurveyCtoConfig),
    Ona(OnaConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::SurveyCto(_) => SourceKind::SurveyCto,
            SourceConfig::Ona(_) => SourceKind::Ona,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SinkConfig {
    Postgres {
        url: String,
        max_connections: u32,
        /// Drop and recreate each table on its first write of a run
        recreate_tables: bool,
        chunk_size: usize,
    },
    Mongo {
        uri: String,
        database: String,
        batch_size: usize,
    },
}

impl SinkConfig {
    pub fn kind(&self) -> SinkKind {
        match self {
            SinkConfig::Postgres { .. } => SinkKind::Postgres,
            SinkConfig::Mongo { .. } => SinkKind::Mongo,
        }
    }
}

/// How a run proceeds, decided from configuration and the form registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Ingest the configured forms
    Forms,
    /// Copy every Ona form's raw submissions into the document store
    Mirror,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub pipeline_name: String,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub forms_file: Option<PathBuf>,
    pub slack_webhook_url: Option<String>,
}

impl IngestConfig {
    /// Load from the process environment (and `.env`), then validate
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, then validate
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let timeout_secs = env.parse::<u64>("FORMSYNC_HTTP_TIMEOUT_SECS")?;

        let source = match env.required("FORMSYNC_SOURCE")?.parse::<SourceKind>()? {
            SourceKind::SurveyCto => {
                let username = env.required("FORMSYNC_SURVEYCTO_USERNAME")?;
                let password = env.required("FORMSYNC_SURVEYCTO_PASSWORD")?;
                let mut config = match (env.get("FORMSYNC_SURVEYCTO_URL"), env.get("FORMSYNC_SURVEYCTO_SERVER")) {
                    (Some(url), _) => SurveyCtoConfig {
                        base_url: url,
                        username,
                        password,
                        timeout_secs: surveycto::DEFAULT_TIMEOUT_SECS,
                        token_max_age_secs: None,
                    },
                    (None, Some(server)) => SurveyCtoConfig::for_server(&server, username, password),
                    (None, None) => return Err(ConfigError::Missing("FORMSYNC_SURVEYCTO_SERVER".to_string())),
                };
                config.timeout_secs = timeout_secs.unwrap_or(config.timeout_secs);
                config.token_max_age_secs = env.parse("FORMSYNC_SURVEYCTO_TOKEN_MAX_AGE_SECS")?;
                SourceConfig::SurveyCto(config)
            },
            SourceKind::Ona => {
                let mut config = OnaConfig::new(
                    env.get("FORMSYNC_ONA_API_URL")
                        .unwrap_or_else(|| ona::DEFAULT_API_URL.to_string()),
                    env.required("FORMSYNC_ONA_TOKEN")?,
                );
                config.timeout_secs = timeout_secs.unwrap_or(config.timeout_secs);
                config.page_size = env.parse("FORMSYNC_ONA_PAGE_SIZE")?;
                SourceConfig::Ona(config)
            },
        };

        let sink = match env.required("FORMSYNC_SINK")?.parse::<SinkKind>()? {
            SinkKind::Postgres => SinkConfig::Postgres {
                url: env.required("FORMSYNC_DATABASE_URL")?,
                max_connections: env
                    .parse("FORMSYNC_DATABASE_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                recreate_tables: env.parse_bool("FORMSYNC_RECREATE_TABLES")?.unwrap_or(false),
                chunk_size: env
                    .parse("FORMSYNC_UPSERT_CHUNK_SIZE")?
                    .unwrap_or(crate::sink::postgres::DEFAULT_CHUNK_SIZE),
            },
            SinkKind::Mongo => SinkConfig::Mongo {
                uri: env.required("FORMSYNC_MONGO_URI")?,
                database: env
                    .get("FORMSYNC_MONGO_DATABASE")
                    .unwrap_or_else(|| DEFAULT_MONGO_DATABASE.to_string()),
                batch_size: env
                    .parse("FORMSYNC_UPSERT_CHUNK_SIZE")?
                    .unwrap_or(crate::sink::mongo::DEFAULT_BATCH_SIZE),
            },
        };

        let config = IngestConfig {
            pipeline_name: env.get("FORMSYNC_PIPELINE_NAME").unwrap_or_else(|| match source.kind() {
                SourceKind::SurveyCto => "surveycto".to_string(),
                SourceKind::Ona => "ona".to_string(),
            }),
            source,
            sink,
            forms_file: env.get("FORMSYNC_FORMS_FILE").map(PathBuf::from),
            slack_webhook_url: env.get("FORMSYNC_SLACK_WEBHOOK_URL"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline_name.trim().is_empty() {
            return Err(ConfigError::invalid("FORMSYNC_PIPELINE_NAME", "cannot be empty"));
        }

        match &self.source {
            SourceConfig::SurveyCto(config) => config.validate()?,
            SourceConfig::Ona(config) => config.validate()?,
        }

        match &self.sink {
            SinkConfig::Postgres {
                url,
                max_connections,
                chunk_size,
                ..
            } => {
                if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                    return Err(ConfigError::invalid(
                        "FORMSYNC_DATABASE_URL",
                        "must start with postgres:// or postgresql://",
                    ));
                }
                if *max_connections == 0 {
                    return Err(ConfigError::invalid(
                        "FORMSYNC_DATABASE_MAX_CONNECTIONS",
                        "must be greater than 0",
                    ));
                }
                if *chunk_size == 0 {
                    return Err(ConfigError::invalid("FORMSYNC_UPSERT_CHUNK_SIZE", "must be greater than 0"));
                }
            },
            SinkConfig::Mongo {
                uri,
                database,
                batch_size,
            } => {
                if !(uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://")) {
                    return Err(ConfigError::invalid(
                        "FORMSYNC_MONGO_URI",
                        "must start with mongodb:// or mongodb+srv://",
                    ));
                }
                if database.trim().is_empty() {
                    return Err(ConfigError::invalid("FORMSYNC_MONGO_DATABASE", "cannot be empty"));
                }
                if *batch_size == 0 {
                    return Err(ConfigError::invalid("FORMSYNC_UPSERT_CHUNK_SIZE", "must be greater than 0"));
                }
            },
        }

        if let Some(url) = &self.slack_webhook_url {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(ConfigError::invalid("FORMSYNC_SLACK_WEBHOOK_URL", "must be an http(s) URL"));
            }
        }

        Ok(())
    }

    /// Load the form registry; no forms file means no forms
    pub fn load_registry(&self) -> Result<SchemaRegistry, ConfigError> {
        let registry = match &self.forms_file {
            Some(path) => SchemaRegistry::load(path)?,
            None => SchemaRegistry::default(),
        };
        if self.sink.kind() == SinkKind::Postgres {
            registry.check_identifier_lengths(postgres::MAX_IDENTIFIER_BYTES)?;
        }
        Ok(registry)
    }

    /// Decide the run mode for a loaded registry
    pub fn run_mode(&self, registry: &SchemaRegistry) -> Result<RunMode, ConfigError> {
        if !registry.is_empty() {
            return Ok(RunMode::Forms);
        }

        match (self.source.kind(), self.sink.kind()) {
            (SourceKind::Ona, SinkKind::Mongo) => Ok(RunMode::Mirror),
            (SourceKind::Ona, SinkKind::Postgres) => Err(ConfigError::invalid(
                "FORMSYNC_SINK",
                "mirroring raw Ona submissions (no forms configured) requires the mongo sink",
            )),
            (SourceKind::SurveyCto, _) => Err(ConfigError::Missing("FORMSYNC_FORMS_FILE".to_string())),
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| raw.parse::<T>().map_err(|e| ConfigError::invalid(key, format!("'{}': {}", raw, e))))
            .transpose()
    }

    fn parse_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get(key)
            .map(|raw| match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, format!("'{}' is not a boolean", raw))),
            })
            .transpose()
    }
}
