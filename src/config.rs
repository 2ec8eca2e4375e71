use std::str::FromStr;

use clap::{
    Arg, ArgAction, ArgMatches, Command,
    builder::NonEmptyStringValueParser,
    error::{ContextKind, ContextValue},
};
use thiserror::Error;

/// Endpoint used by the single-endpoint variant when no `--uri` is given.
pub const DEFAULT_URI: &str = "unix:flora-dispatcher-socket";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPolicy {
    /// Exactly one endpoint; a later `--uri` replaces the earlier one.
    Single,
    /// One or more endpoints from repeated `--uri`, bound in order.
    Multi,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    /// 0 leaves the size to the dispatch engine.
    pub msg_buf_size: u32,
    pub endpoints: Vec<String>,
    pub log_file: Option<String>,
    pub log_port: Option<u16>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Help,
    Version,
    Run(Configuration),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid option: --{key}{}", display_value(.value))]
    InvalidOption { key: String, value: String },
    #[error("no --uri given")]
    MissingEndpoint,
}

fn display_value(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        format!("={}", value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Flag,
    Text,
    U32,
    U16,
}

struct OptionSpec {
    key: &'static str,
    kind: Kind,
    value_name: &'static str,
    help: &'static str,
}

const SCHEMA: &[OptionSpec] = &[
    OptionSpec {
        key: "help",
        kind: Kind::Flag,
        value_name: "",
        help: "Print this help message",
    },
    OptionSpec {
        key: "version",
        kind: Kind::Flag,
        value_name: "",
        help: "Print the version",
    },
    OptionSpec {
        key: "uri",
        kind: Kind::Text,
        value_name: "URI",
        help: "Endpoint to serve, e.g. unix:/run/dispatchd.sock or tcp://0.0.0.0:2517/ (repeatable)",
    },
    OptionSpec {
        key: "msg-buf-size",
        kind: Kind::U32,
        value_name: "BYTES",
        help: "Message buffer size, 0 for the engine default",
    },
    OptionSpec {
        key: "log-file",
        kind: Kind::Text,
        value_name: "PATH",
        help: "Write diagnostics to this file",
    },
    OptionSpec {
        key: "log-service-port",
        kind: Kind::U16,
        value_name: "PORT",
        help: "Serve diagnostics to TCP collectors on this port",
    },
];

struct OptionPair<'a> {
    key: &'a str,
    value: Option<&'a str>,
}

fn option_pairs(args: &[String]) -> impl Iterator<Item = OptionPair<'_>> {
    long_options(args)
        .filter_map(|arg| arg.strip_prefix("--"))
        .map(|body| match body.split_once('=') {
            Some((key, value)) => OptionPair {
                key,
                value: Some(value),
            },
            None => OptionPair {
                key: body,
                value: None,
            },
        })
}

/// Everything shaped like `--key[=value]`; a bare `--` and anything else
/// on the command line is not an option and is skipped.
fn long_options(args: &[String]) -> impl Iterator<Item = &String> {
    args.iter()
        .filter(|arg| arg.len() > 2 && arg.starts_with("--"))
}

fn unsigned<T: FromStr>(raw: &str) -> Result<T, String> {
    // `str::parse` tolerates a leading '+', the option syntax does not
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("`{}` is not an unsigned decimal integer", raw));
    }
    raw.parse().map_err(|_| format!("`{}` is out of range", raw))
}

/// Recovers the offending `--key[=value]` from a clap error. clap names the
/// option either bare (`--nope`) or with its value placeholder
/// (`--msg-buf-size=<BYTES>`), and only carries the value when it got far
/// enough to validate one.
fn rejected(err: &clap::Error, args: &[String]) -> ParseError {
    let named = match err.get(ContextKind::InvalidArg) {
        Some(ContextValue::String(arg)) => {
            let name = arg.strip_prefix("--").unwrap_or(arg.as_str());
            name.split(['=', ' ', '<']).next().unwrap_or(name)
        }
        _ => "",
    };
    let given = option_pairs(args).find(|pair| named.is_empty() || pair.key == named);
    let value = match err.get(ContextKind::InvalidValue) {
        Some(ContextValue::String(value)) => value.as_str(),
        _ => given.as_ref().and_then(|pair| pair.value).unwrap_or_default(),
    };
    let key = if named.is_empty() {
        given.map_or("", |pair| pair.key)
    } else {
        named
    };
    ParseError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn last<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> Option<T> {
    matches.get_many::<T>(id)?.last().cloned()
}

/// Interprets process arguments (without the program name).
///
/// `--help` and `--version` win over everything else: when either appears
/// the remaining options are not validated at all. Otherwise options are
/// checked in command-line order and the first bad one is reported; a
/// missing endpoint is only reported once every option is valid.
pub fn parse(args: &[String], policy: EndpointPolicy) -> Result<Action, ParseError> {
    let has_flag = |name: &str| option_pairs(args).any(|pair| pair.key == name);
    if has_flag("help") {
        return Ok(Action::Help);
    }
    if has_flag("version") {
        return Ok(Action::Version);
    }

    let matches = command()
        .no_binary_name(true)
        .try_get_matches_from(long_options(args))
        .map_err(|e| rejected(&e, args))?;

    let mut endpoints: Vec<String> = matches
        .get_many::<String>("uri")
        .into_iter()
        .flatten()
        .cloned()
        .collect();
    match policy {
        EndpointPolicy::Single if endpoints.is_empty() => endpoints.push(DEFAULT_URI.to_string()),
        EndpointPolicy::Single => {
            let earlier = endpoints.len() - 1;
            endpoints.drain(..earlier);
        }
        EndpointPolicy::Multi if endpoints.is_empty() => return Err(ParseError::MissingEndpoint),
        EndpointPolicy::Multi => {}
    }

    Ok(Action::Run(Configuration {
        msg_buf_size: last::<u32>(&matches, "msg-buf-size").unwrap_or(0),
        endpoints,
        log_file: last::<String>(&matches, "log-file"),
        log_port: last::<u16>(&matches, "log-service-port").filter(|port| *port > 0),
    }))
}

fn command() -> Command {
    SCHEMA.iter().fold(
        Command::new(env!("CARGO_PKG_NAME"))
            .version(env!("CARGO_PKG_VERSION"))
            .about("Message dispatch service")
            .disable_help_flag(true)
            .disable_version_flag(true),
        |cmd, spec| {
            let arg = Arg::new(spec.key).long(spec.key).help(spec.help);
            let arg = match spec.kind {
                Kind::Flag if spec.key == "help" => arg.action(ArgAction::Help),
                Kind::Flag => arg.action(ArgAction::Version),
                kind => {
                    let arg = arg
                        .value_name(spec.value_name)
                        .require_equals(true)
                        .action(ArgAction::Append);
                    match kind {
                        Kind::U32 => arg.value_parser(unsigned::<u32>),
                        Kind::U16 => arg.value_parser(unsigned::<u16>),
                        _ => arg.value_parser(NonEmptyStringValueParser::new()),
                    }
                }
            };
            cmd.arg(arg)
        },
    )
}

pub fn help_text() -> String {
    command().render_help().to_string()
}

pub fn version_text() -> String {
    command().render_version()
}
