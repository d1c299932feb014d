use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use std::path::PathBuf;

/// Settings given on the command line. Only flags that were set end up in
/// the serialized form, so they override the file and environment without
/// resetting anything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Overrides {
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compose_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogOverrides>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub verbose: bool,
}

impl From<ArgMatches> for Overrides {
    fn from(matches: ArgMatches) -> Self {
        let level = matches.get_one::<String>("log-level").cloned();
        let verbose = matches.get_flag("verbose");
        Overrides {
            config_file: matches.get_one::<PathBuf>("config").cloned(),
            port: matches.get_one::<u16>("port").copied(),
            compose_root: matches.get_one::<PathBuf>("compose-root").cloned(),
            config_dir: matches.get_one::<PathBuf>("config-dir").cloned(),
            machine_addr: matches.get_one::<String>("machine-addr").cloned(),
            log: (level.is_some() || verbose).then_some(LogOverrides { level, verbose }),
        }
    }
}

pub fn command() -> Command {
    Command::new("dockman")
        .version(env!("CARGO_PKG_VERSION"))
        .about("manage docker compose stacks on local and remote hosts")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("YAML config file, read before DOCKMAN_* variables")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port the HTTP API listens on")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("compose-root")
                .long("compose-root")
                .help("Absolute directory holding the compose projects")
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("config-dir")
                .long("config-dir")
                .help("Directory of the database")
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("machine-addr")
                .long("machine-addr")
                .help("Address shown for published ports")
                .value_name("ADDR"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .help("Log filter, e.g. info or dockman=debug")
                .value_name("LEVEL"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log at debug level")
                .action(ArgAction::SetTrue),
        )
}

pub fn parse() -> Overrides {
    command().get_matches().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(args: &[&str]) -> Overrides {
        command()
            .try_get_matches_from(std::iter::once("dockman").chain(args.iter().copied()))
            .unwrap()
            .into()
    }

    #[test]
    fn unset_flags_are_not_serialized() {
        let parsed = overrides(&[]);
        assert_eq!(serde_json::to_value(&parsed).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn set_flags_override() {
        let parsed = overrides(&["-c", "/etc/dockman.yaml", "--port", "9000", "-v"]);
        assert_eq!(parsed.config_file, Some(PathBuf::from("/etc/dockman.yaml")));
        assert_eq!(
            serde_json::to_value(&parsed).unwrap(),
            serde_json::json!({"port": 9000, "log": {"verbose": true}})
        );
    }

    #[test]
    fn overrides_win_over_defaults() {
        figment::Jail::expect_with(|_jail| {
            let parsed = overrides(&["--compose-root", "/srv/stacks", "--log-level", "warn"]);
            let config = crate::config::Config::load(None, &parsed).unwrap();
            assert_eq!(config.compose_root, PathBuf::from("/srv/stacks"));
            assert_eq!(config.log.level, "warn");
            assert_eq!(config.port, 8866);
            Ok(())
        });
    }
}
