use std::fs;

use anyhow::{Context, Result};
use sluice_config::Config;
use sluice_statsd::{Metrics, MetricsConfig};

/// Checks the config for problems that are only detectable at startup.
///
/// Creates the state directory if persisted pipelines need one.
pub fn check_config(config: &Config) -> Result<()> {
    if config.active_pipelines().next().is_none() {
        anyhow::bail!("no histogram pipeline is configured with ports to listen on");
    }

    let persisted = config
        .active_pipelines()
        .any(|granularity| config.pipeline(granularity).persisted);

    if persisted && let Some(state_dir) = config.state_dir() {
        fs::create_dir_all(state_dir).with_context(|| {
            format!("failed to create state directory {}", state_dir.display())
        })?;
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        sluice_log::info!("launching sluice without config folder");
    } else {
        sluice_log::info!(
            "launching sluice from config folder {}",
            config.path().display()
        );
    }

    match config.state_dir() {
        Some(dir) => sluice_log::info!("  state dir: {}", dir.display()),
        None => sluice_log::info!("  state dir: -"),
    };
    for granularity in config.active_pipelines() {
        let ports = &config.pipeline(granularity).ports;
        sluice_log::info!("  {granularity} pipeline: ports {ports:?}");
    }
    sluice_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
///
/// Returns a no-op handle if no statsd server is configured.
pub fn init_metrics(config: &Config) -> Result<Metrics> {
    let Some(host) = config.statsd_addr() else {
        return Ok(Metrics::noop());
    };

    let mut default_tags = config.metrics_default_tags().clone();
    if let Some(hostname_tag) = config.metrics_hostname_tag()
        && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
    {
        default_tags.insert(hostname_tag.to_owned(), hostname);
    }

    let metrics = sluice_statsd::init(MetricsConfig {
        prefix: config.metrics_prefix().to_owned(),
        host: host.to_owned(),
        default_tags,
        sample_rate: config.metrics_sample_rate(),
        aggregate: config.metrics_aggregate(),
    })?;

    Ok(metrics)
}
