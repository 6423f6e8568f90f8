//! This module implements the definition of the command line app.

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command, value_parser};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Sluice accumulates streaming samples into histograms and ships them \
                         once their time window has closed.";

pub fn make_app() -> Command {
    Command::new("sluice")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .action(ArgAction::Set)
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run").about("Run sluice").after_help(
                "This runs sluice in the foreground until it's shut down. It binds to the \
                 ports configured for each histogram pipeline and reports ripe histograms \
                 as JSON lines.",
            ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the sluice config")
                .after_help("This command provides basic config management.")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("show")
                        .about("Show the entire config out for debugging purposes")
                        .after_help(
                            "This dumps out the entire config including the values which \
                             are not in the config file but filled in from defaults.",
                        ),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_definition() {
        make_app().debug_assert();
    }

    #[test]
    fn test_config_is_global() {
        let matches = make_app()
            .try_get_matches_from(["sluice", "run", "--config", "/etc/sluice"])
            .unwrap();

        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(
            sub.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("/etc/sluice"))
        );
    }

    #[test]
    fn test_subcommand_required() {
        assert!(make_app().try_get_matches_from(["sluice"]).is_err());
        assert!(make_app().try_get_matches_from(["sluice", "config"]).is_err());
    }
}
