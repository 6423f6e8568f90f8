use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::ArgMatches;
use sluice_config::Config;

use crate::{cliapp, server, setup};

/// Config folder used when `--config` is not passed.
const DEFAULT_CONFIG_PATH: &str = ".sluice";

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = cliapp::make_app();
    let matches = app.get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .map(PathBuf::as_path)
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    let config = Config::from_path(config_path)?;

    // Logging is initialized before any subcommand so that all of them can log. The config
    // commands only log at debug level, which is filtered by default.
    sluice_log::init(config.logging());

    if let Some(matches) = matches.subcommand_matches("config") {
        manage_config(&config, matches)
    } else if matches.subcommand_matches("run").is_some() {
        run(config)
    } else {
        unreachable!();
    }
}

pub fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("show", _)) => {
            let yaml = config.to_yaml_string()?;
            io::stdout().lock().write_all(yaml.as_bytes())?;
            Ok(())
        }
        Some((other, _)) => bail!("unknown config subcommand '{other}'"),
        None => unreachable!(),
    }
}

pub fn run(config: Config) -> Result<()> {
    setup::dump_spawn_infos(&config);
    setup::check_config(&config)?;
    let metrics = setup::init_metrics(&config)?;

    server::run(config, metrics)?;

    Ok(())
}
