//! Runtime-defined command line options.
//!
//! Options are declared at runtime (switches and value options) and read from
//! three sources, lowest precedence first:
//!
//! 1. an options file in TOML (`long-name = value`),
//! 2. environment variables named `<PREFIX><LONG_NAME>`,
//! 3. the command line.
//!
//! Parsing stops at the first operand; everything after it is left for the
//! application and available through [`Options::arguments`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Print usage and exit.
pub const HELP: &str = "help";
/// Print version and exit.
pub const VERSION: &str = "version";
/// Print the options found and exit.
pub const INFO: &str = "info";
/// Detach into the background.
pub const DAEMON: &str = "daemon";
/// Run as this user.
pub const USER: &str = "user";
/// Run as this group.
pub const GROUP: &str = "group";

const OPERANDS: &str = "%operands";

/// Kind of a declared option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Boolean flag without a value
    Switch,
    /// Option taking one value
    Value,
}

/// Declaration of a single option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSpec {
    short: Option<char>,
    long: String,
    description: String,
    kind: OptionKind,
}

impl OptionSpec {
    /// Short form, e.g. `d` for `-d`.
    #[must_use]
    pub const fn short(&self) -> Option<char> {
        self.short
    }

    /// Long name, also the options-file key.
    #[must_use]
    pub fn long(&self) -> &str {
        &self.long
    }

    /// Help text.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Switch or value option.
    #[must_use]
    pub const fn kind(&self) -> OptionKind {
        self.kind
    }
}

/// Value of an option that was found in one of the sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Switch state
    Switch(bool),
    /// Option argument
    Value(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switch(true) => f.write_str("yes"),
            Self::Switch(false) => f.write_str("no"),
            Self::Value(value) => f.write_str(value),
        }
    }
}

/// Declared options and the values read for them.
#[derive(Debug, Clone, Default)]
pub struct Options {
    program: String,
    specs: Vec<OptionSpec>,
    found: BTreeMap<String, OptionValue>,
    arguments: Vec<String>,
    options_file: Option<PathBuf>,
    env_prefix: Option<String>,
}

impl Options {
    /// Create an empty option set for `program`.
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Create an option set with the built-in daemon options declared.
    #[must_use]
    pub fn with_builtins<S: Into<String>>(program: S) -> Self {
        let mut options = Self::new(program);
        for (short, long, description, kind) in [
            ('h', HELP, "Print this help and exit", OptionKind::Switch),
            ('v', VERSION, "Print version information and exit", OptionKind::Switch),
            ('i', INFO, "Print the options that are set and exit", OptionKind::Switch),
            ('d', DAEMON, "Detach and run in the background", OptionKind::Switch),
            ('u', USER, "Run as this user", OptionKind::Value),
            ('g', GROUP, "Run as this group", OptionKind::Value),
        ] {
            options.specs.push(OptionSpec {
                short: Some(short),
                long: long.to_string(),
                description: description.to_string(),
                kind,
            });
        }
        options
    }

    /// Read the options file at `path` before the environment.
    pub fn set_options_file(&mut self, path: Option<PathBuf>) {
        self.options_file = path;
    }

    /// Read environment variables named `<prefix><LONG_NAME>`.
    pub fn set_env_prefix(&mut self, prefix: Option<String>) {
        self.env_prefix = prefix;
    }

    /// Declare a switch.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is malformed or already declared.
    pub fn add_switch_option(
        &mut self,
        short: Option<char>,
        long: &str,
        description: &str,
    ) -> Result<()> {
        self.add_option(short, long, description, OptionKind::Switch)
    }

    /// Declare an option that takes a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is malformed or already declared.
    pub fn add_value_option(
        &mut self,
        short: Option<char>,
        long: &str,
        description: &str,
    ) -> Result<()> {
        self.add_option(short, long, description, OptionKind::Value)
    }

    fn add_option(
        &mut self,
        short: Option<char>,
        long: &str,
        description: &str,
        kind: OptionKind,
    ) -> Result<()> {
        if long.is_empty()
            || long.starts_with('-')
            || long.chars().any(|c| c.is_whitespace() || c == '=')
        {
            return Err(Error::options(format!("Invalid option name '{long}'")));
        }
        if let Some(c) = short {
            if !c.is_ascii_alphanumeric() {
                return Err(Error::options(format!("Invalid short option '{c}'")));
            }
        }
        if self.spec(long).is_some() {
            return Err(Error::options(format!("Option '--{long}' is already declared")));
        }
        if short.is_some() && self.specs.iter().any(|s| s.short == short) {
            return Err(Error::options(format!(
                "Short option '-{}' is already declared",
                short.unwrap_or_default()
            )));
        }

        self.specs.push(OptionSpec {
            short,
            long: long.to_string(),
            description: description.to_string(),
            kind,
        });
        Ok(())
    }

    /// Read all sources. `args` includes the program name first.
    ///
    /// Returns the index of the first argument that was not consumed.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown options, missing option arguments or an
    /// unreadable options file.
    pub fn read_options<I, T>(&mut self, args: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.found.clear();
        self.arguments.clear();

        if let Some(path) = self.options_file.clone() {
            self.read_file(&path)?;
        }
        if let Some(prefix) = self.env_prefix.clone() {
            self.read_env(&prefix);
        }

        let matches = self.command().try_get_matches_from(&args)?;
        self.read_matches(&matches);

        let consumed = args.len().saturating_sub(self.arguments.len());
        debug!(consumed, found = self.found.len(), "Options read");
        Ok(consumed)
    }

    fn read_file(&mut self, path: &Path) -> Result<()> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No options file");
                return Ok(());
            }
            Err(e) => {
                return Err(Error::options_with_source(
                    format!("Failed to read options file {}", path.display()),
                    e,
                ))
            }
        };

        let table: toml::Table = content.parse()?;
        for (key, value) in table {
            let Some(kind) = self.spec(&key).map(OptionSpec::kind) else {
                warn!(option = %key, path = %path.display(), "Unknown option in options file");
                continue;
            };
            let value = match (kind, value) {
                (OptionKind::Switch, toml::Value::Boolean(b)) => OptionValue::Switch(b),
                (OptionKind::Switch, toml::Value::String(s)) => OptionValue::Switch(is_truthy(&s)),
                (OptionKind::Switch, toml::Value::Integer(i)) => OptionValue::Switch(i != 0),
                (OptionKind::Value, toml::Value::String(s)) => OptionValue::Value(s),
                (
                    OptionKind::Value,
                    v @ (toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Boolean(_)),
                ) => OptionValue::Value(v.to_string()),
                _ => {
                    return Err(Error::options(format!(
                        "Unsupported value for option '{key}' in {}",
                        path.display()
                    )))
                }
            };
            self.found.insert(key, value);
        }
        Ok(())
    }

    fn read_env(&mut self, prefix: &str) {
        for spec in &self.specs {
            let name = env_var_name(prefix, &spec.long);
            let value = match std::env::var(&name) {
                Ok(value) => value,
                Err(std::env::VarError::NotPresent) => continue,
                Err(std::env::VarError::NotUnicode(_)) => {
                    warn!(variable = %name, "Ignoring non-UTF-8 environment variable");
                    continue;
                }
            };
            let value = match spec.kind {
                OptionKind::Switch => OptionValue::Switch(is_truthy(&value)),
                OptionKind::Value => OptionValue::Value(value),
            };
            self.found.insert(spec.long.clone(), value);
        }
    }

    fn read_matches(&mut self, matches: &ArgMatches) {
        for spec in &self.specs {
            if matches.value_source(&spec.long) != Some(ValueSource::CommandLine) {
                continue;
            }
            let value = match spec.kind {
                OptionKind::Switch => OptionValue::Switch(matches.get_flag(&spec.long)),
                OptionKind::Value => match matches.get_one::<String>(&spec.long) {
                    Some(value) => OptionValue::Value(value.clone()),
                    None => continue,
                },
            };
            self.found.insert(spec.long.clone(), value);
        }

        self.arguments = matches
            .get_many::<String>(OPERANDS)
            .map(|values| values.cloned().collect())
            .unwrap_or_default();
    }

    fn command(&self) -> Command {
        let mut command = Command::new(self.program.clone())
            .disable_help_flag(true)
            .disable_version_flag(true)
            .args_override_self(true);

        for spec in &self.specs {
            let mut arg = Arg::new(spec.long.clone())
                .long(spec.long.clone())
                .help(spec.description.clone());
            if let Some(short) = spec.short {
                arg = arg.short(short);
            }
            arg = match spec.kind {
                OptionKind::Switch => arg.action(ArgAction::SetTrue),
                OptionKind::Value => arg.action(ArgAction::Set).num_args(1).value_name("VALUE"),
            };
            command = command.arg(arg);
        }

        command.arg(
            Arg::new(OPERANDS)
                .num_args(0..)
                .action(ArgAction::Append)
                .trailing_var_arg(true)
                .hide(true),
        )
    }

    /// Usage text listing every declared option.
    #[must_use]
    pub fn render_help(&self) -> String {
        self.command().render_help().to_string()
    }

    fn spec(&self, long: &str) -> Option<&OptionSpec> {
        self.specs.iter().find(|s| s.long == long)
    }

    /// Declared options.
    #[must_use]
    pub fn specs(&self) -> &[OptionSpec] {
        &self.specs
    }

    /// Whether switch `long` is on.
    #[must_use]
    pub fn switch(&self, long: &str) -> bool {
        matches!(self.found.get(long), Some(OptionValue::Switch(true)))
    }

    /// Value of option `long`, if any source provided one.
    #[must_use]
    pub fn value(&self, long: &str) -> Option<&str> {
        match self.found.get(long) {
            Some(OptionValue::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// All options found, by long name.
    #[must_use]
    pub const fn found(&self) -> &BTreeMap<String, OptionValue> {
        &self.found
    }

    /// Arguments left after option parsing.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Program name used in usage output.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Environment variable consulted for option `long`.
#[must_use]
pub fn env_var_name(prefix: &str, long: &str) -> String {
    let mut name = String::with_capacity(prefix.len() + long.len());
    name.push_str(prefix);
    name.extend(
        long.chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() }),
    );
    name
}

/// Switch value from a file or the environment.
fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty()
        || ["no", "false", "off", "0"]
            .iter()
            .any(|falsy| value.eq_ignore_ascii_case(falsy)))
}
