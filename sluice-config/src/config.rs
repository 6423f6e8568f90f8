use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sluice_histogram::{Granularity, PipelineConfig};

/// Defines the source of a config error.
#[derive(Debug)]
enum ConfigErrorSource {
    /// An error occurring independently.
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating from a specific field.
    Field(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::Field(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            inner: Some(Box::new(inner)),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: impl Into<String>) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: impl Into<String>) -> Self {
        self.source = ConfigErrorSource::Field(name.into());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
    /// A persisted pipeline is configured, but no state directory.
    #[error("persisted pipelines require a state directory")]
    MissingStateDir,
    /// Two pipelines listen on the same port.
    #[error("port is used by more than one pipeline")]
    DuplicatePort,
}

enum ConfigFormat {
    Yaml,
}

impl ConfigFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "yml",
        }
    }
}

trait ConfigObject: DeserializeOwned + Serialize {
    /// The format in which to serialize this configuration.
    fn format() -> ConfigFormat;

    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.{}", Self::name(), Self::format().extension()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        match Self::format() {
            ConfigFormat::Yaml => serde_yaml::from_reader(io::BufReader::new(f))
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path)),
        }
    }

    /// Writes the configuration object to the given writer.
    fn write<W: Write>(&self, writer: &mut W) -> Result<(), ConfigError> {
        match Self::format() {
            ConfigFormat::Yaml => serde_yaml::to_writer(writer, self)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile)),
        }
    }
}

/// Controls internal reporting to statsd.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables metrics.
    pub statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"sluice"`.
    pub prefix: String,
    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// Defaults to `1.0`.
    pub sample_rate: f64,
    /// Aggregate metrics locally before sending them to statsd.
    ///
    /// Defaults to `true`.
    pub aggregate: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "sluice".to_owned(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
            sample_rate: 1.0,
            aggregate: true,
        }
    }
}

/// Controls runtime limits.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    /// The maximum number of seconds to wait for pending work after receiving a shutdown
    /// signal.
    pub shutdown_timeout: u64,
    /// The maximum length of a single line accepted by listeners, in bytes.
    ///
    /// Longer lines are discarded.
    pub max_line_length: usize,
    /// The number of worker threads of each pipeline's runtime.
    pub pipeline_threads: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            shutdown_timeout: 10,
            max_line_length: 32 * 1024,
            pipeline_threads: 2,
        }
    }
}

/// Configuration of the histogram pipelines.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Histogram {
    /// Directory for stores and tapes of persisted pipelines.
    ///
    /// Relative paths are resolved against the config directory.
    pub state_dir: Option<PathBuf>,
    /// The network interface listeners bind to.
    ///
    /// Defaults to `0.0.0.0`.
    pub host: Option<String>,
    /// File ripe histograms are appended to as JSON lines.
    ///
    /// Defaults to `None`, which writes to stdout.
    pub report: Option<PathBuf>,
    /// The minute pipeline.
    pub minute: PipelineConfig,
    /// The hour pipeline.
    pub hour: PipelineConfig,
    /// The day pipeline.
    pub day: PipelineConfig,
    /// The distribution pipeline.
    pub dist: PipelineConfig,
}

impl Histogram {
    /// Returns the configuration of the pipeline for `granularity`.
    pub fn pipeline(&self, granularity: Granularity) -> &PipelineConfig {
        match granularity {
            Granularity::Minute => &self.minute,
            Granularity::Hour => &self.hour,
            Granularity::Day => &self.day,
            Granularity::Dist => &self.dist,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ConfigValues {
    #[serde(default)]
    logging: sluice_log::LogConfig,
    #[serde(default)]
    metrics: Metrics,
    #[serde(default)]
    limits: Limits,
    #[serde(default)]
    histogram: Histogram,
}

impl ConfigObject for ConfigValues {
    fn format() -> ConfigFormat {
        ConfigFormat::Yaml
    }

    fn name() -> &'static str {
        "config"
    }
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads and validates a config from a given config folder.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let mut values = ConfigValues::load(&path)?;
        if let Some(state_dir) = &mut values.histogram.state_dir {
            if state_dir.is_relative() {
                *state_dir = path.join(&*state_dir);
            }
        }

        let config = Config { values, path };
        if let Err(error) = config.validate() {
            return Err(match error.source {
                ConfigErrorSource::None => error.file(ConfigValues::path(&config.path)),
                _ => error,
            });
        }

        Ok(config)
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests. The config is not validated.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Checks the configuration for values Sluice cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let histogram = &self.values.histogram;
        let mut ports = BTreeMap::new();

        for granularity in Granularity::ALL {
            let pipeline = histogram.pipeline(granularity);
            let field = format!("histogram.{}", granularity_field(granularity));

            pipeline
                .validate(granularity)
                .map_err(|e| ConfigError::for_field(e, field.clone()))?;

            if pipeline.persisted && histogram.state_dir.is_none() {
                return Err(ConfigError::new(ConfigErrorKind::MissingStateDir).field(field));
            }

            for &port in &pipeline.ports {
                if ports.insert(port, granularity).is_some() {
                    return Err(ConfigError::new(ConfigErrorKind::DuplicatePort)
                        .field(format!("{field}.ports")));
                }
            }
        }

        Ok(())
    }

    /// Serializes the effective configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        let mut buf = Vec::new();
        self.values.write(&mut buf)?;
        String::from_utf8(buf).map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// The config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &sluice_log::LogConfig {
        &self.values.logging
    }

    /// Returns the statsd server to report to, if metrics are enabled.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix for all metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags for statsd metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the name of the hostname tag that should be attached to each outgoing metric.
    pub fn metrics_hostname_tag(&self) -> Option<&str> {
        self.values.metrics.hostname_tag.as_deref()
    }

    /// Returns the global sample rate for all metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }

    /// Returns whether metrics are aggregated before sending them to statsd.
    pub fn metrics_aggregate(&self) -> bool {
        self.values.metrics.aggregate
    }

    /// Returns the maximum time to wait for pipelines to stop.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }

    /// Returns the maximum length of an accepted line in bytes.
    pub fn max_line_length(&self) -> usize {
        self.values.limits.max_line_length
    }

    /// Returns the number of worker threads per pipeline runtime.
    pub fn pipeline_threads(&self) -> usize {
        self.values.limits.pipeline_threads.max(1)
    }

    /// Returns the directory for persisted stores and tapes.
    pub fn state_dir(&self) -> Option<&Path> {
        self.values.histogram.state_dir.as_deref()
    }

    /// Returns the interface listeners bind to.
    pub fn listen_host(&self) -> &str {
        self.values.histogram.host.as_deref().unwrap_or("0.0.0.0")
    }

    /// Returns the file histograms are reported to, or `None` for stdout.
    pub fn report_path(&self) -> Option<&Path> {
        self.values.histogram.report.as_deref()
    }

    /// Returns the configuration of the pipeline for `granularity`.
    pub fn pipeline(&self, granularity: Granularity) -> &PipelineConfig {
        self.values.histogram.pipeline(granularity)
    }

    /// Returns the granularities of all pipelines that accept lines on at least one port.
    pub fn active_pipelines(&self) -> impl Iterator<Item = Granularity> + '_ {
        Granularity::ALL
            .into_iter()
            .filter(|&g| !self.pipeline(g).ports.is_empty())
    }
}

/// The key of a pipeline section in the config file.
fn granularity_field(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Minute => "minute",
        Granularity::Hour => "hour",
        Granularity::Day => "day",
        Granularity::Dist => "dist",
    }
}
