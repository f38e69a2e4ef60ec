//! Unit file YAML schema

use crate::description::ProcessDescription;
use crate::runtime::monitor::{ExecuteOptions, RespawnSetting};
use crate::runtime::output::OutputDestination;
use crate::runtime::relay::DEFAULT_OUTPUT_FORMAT;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// One supervised process described in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitFile {
    /// Launch arguments with defaults, usable as `$(arg name)`
    #[serde(default)]
    pub args: IndexMap<String, ArgDefinition>,

    /// Human-readable name, defaults to the executable's file name
    #[serde(default)]
    pub name: Option<String>,

    /// Executable and arguments, as a list or a whitespace separated line
    pub cmd: CommandValue,

    #[serde(default)]
    pub cwd: Option<String>,

    /// Full environment replacing the inherited one
    #[serde(default)]
    pub env: Option<IndexMap<String, String>>,

    /// Variables added to the environment
    #[serde(default)]
    pub additional_env: IndexMap<String, String>,

    #[serde(default)]
    pub shell: bool,

    #[serde(default)]
    pub emulate_tty: bool,

    /// `screen`, `log` or `both`
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default)]
    pub output_format: Option<String>,

    #[serde(default)]
    pub cached_output: bool,

    #[serde(default)]
    pub log_cmd: bool,

    /// Seconds between SIGINT and SIGTERM
    #[serde(default)]
    pub sigterm_timeout: Option<f64>,

    /// Seconds between SIGTERM and SIGKILL
    #[serde(default)]
    pub sigkill_timeout: Option<f64>,

    /// Boolean or a string like "$(arg respawn)"
    #[serde(default = "default_respawn")]
    pub respawn: FlagValue,

    /// Seconds to wait before respawning
    #[serde(default)]
    pub respawn_delay: Option<f64>,

    /// Negative for unlimited
    #[serde(default = "default_max_retries")]
    pub respawn_max_retries: i64,

    #[serde(default)]
    pub wait_on_child_processes: bool,
}

fn default_output() -> String {
    "log".to_string()
}

fn default_respawn() -> FlagValue {
    FlagValue::Bool(false)
}

fn default_max_retries() -> i64 {
    -1
}

/// Argument definition with an optional default value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgDefinition {
    #[serde(default)]
    pub default: Option<ArgValue>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Argument values can be strings, booleans, or numbers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(x) => write!(f, "{}", x),
            ArgValue::String(s) => f.write_str(s),
        }
    }
}

/// Command given as an argv list or a single line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandValue {
    Argv(Vec<String>),
    Line(String),
}

impl CommandValue {
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandValue::Argv(argv) => argv.clone(),
            CommandValue::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// Flag value can be a direct boolean or a substitution string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    String(String),
}

impl From<&FlagValue> for RespawnSetting {
    fn from(value: &FlagValue) -> Self {
        match value {
            FlagValue::Bool(b) => RespawnSetting::Bool(*b),
            FlagValue::String(s) => RespawnSetting::Expr(s.clone()),
        }
    }
}

impl UnitFile {
    /// Load a unit file from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, UnitFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| UnitFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a unit file from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, UnitFileError> {
        let unit: UnitFile = serde_yaml::from_str(content).map_err(UnitFileError::Parse)?;
        unit.validate()?;
        Ok(unit)
    }

    /// Validate the unit configuration
    pub fn validate(&self) -> Result<(), UnitFileError> {
        if self.cmd.to_argv().is_empty() {
            return Err(UnitFileError::Validation("'cmd' must not be empty".to_string()));
        }

        self.output
            .parse::<OutputDestination>()
            .map_err(|e| UnitFileError::Validation(e.to_string()))?;

        for (field, value) in [
            ("sigterm_timeout", self.sigterm_timeout),
            ("sigkill_timeout", self.sigkill_timeout),
            ("respawn_delay", self.respawn_delay),
        ] {
            if let Some(secs) = value {
                seconds(field, secs)?;
            }
        }

        Ok(())
    }

    /// Launch configurations: argument defaults overridden by `overrides`.
    /// Every declared argument must end up with a value.
    pub fn launch_configurations(
        &self,
        overrides: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, UnitFileError> {
        let mut configs = HashMap::new();
        for (name, def) in &self.args {
            let value = match (overrides.get(name), &def.default) {
                (Some(value), _) => value.clone(),
                (None, Some(default)) => default.to_string(),
                (None, None) => {
                    return Err(UnitFileError::Validation(format!(
                        "Argument '{}' has no default and was not provided",
                        name
                    )))
                }
            };
            configs.insert(name.clone(), value);
        }

        for (name, value) in overrides {
            if !self.args.contains_key(name) {
                log::debug!("Argument '{}' is not declared by the unit", name);
                configs.insert(name.clone(), value.clone());
            }
        }

        Ok(configs)
    }

    /// Process description of the unit
    pub fn description(&self) -> ProcessDescription {
        ProcessDescription {
            name: self.name.clone(),
            cmd: self.cmd.to_argv(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            additional_env: self.additional_env.clone(),
        }
    }

    /// Execution options of the unit
    pub fn options(&self) -> Result<ExecuteOptions, UnitFileError> {
        let opt_seconds = |field: &str, value: Option<f64>| -> Result<Option<Duration>, UnitFileError> {
            value.map(|secs| seconds(field, secs)).transpose()
        };

        Ok(ExecuteOptions {
            shell: self.shell,
            emulate_tty: self.emulate_tty,
            output: self.output.clone(),
            output_format: self
                .output_format
                .clone()
                .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.to_string()),
            cached_output: self.cached_output,
            log_cmd: self.log_cmd,
            sigterm_timeout: opt_seconds("sigterm_timeout", self.sigterm_timeout)?,
            sigkill_timeout: opt_seconds("sigkill_timeout", self.sigkill_timeout)?,
            respawn: RespawnSetting::from(&self.respawn),
            respawn_delay: opt_seconds("respawn_delay", self.respawn_delay)?,
            respawn_max_retries: self.respawn_max_retries,
            wait_on_child_processes: self.wait_on_child_processes,
        })
    }
}

fn seconds(field: &str, secs: f64) -> Result<Duration, UnitFileError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        UnitFileError::Validation(format!(
            "'{}' must be a non-negative number of seconds, got {}",
            field, secs
        ))
    })
}

/// Errors that can occur when loading a unit file
#[derive(Debug, thiserror::Error)]
pub enum UnitFileError {
    #[error("Failed to read unit file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse unit file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_unit_file() {
        let yaml = r#"
args:
  greeting:
    default: hello
  retries:
    default: 3
name: talker
cmd: ["echo", "$(arg greeting)"]
cwd: /tmp
additional_env:
  RUST_BACKTRACE: "1"
output: screen
output_format: "{name}: {line}"
cached_output: true
sigterm_timeout: 1.5
sigkill_timeout: 2
respawn: "$(arg respawn)"
respawn_delay: 0.25
respawn_max_retries: 4
wait_on_child_processes: true
"#;
        let unit = UnitFile::from_yaml(yaml).unwrap();
        assert_eq!(unit.name.as_deref(), Some("talker"));
        assert_eq!(unit.cmd.to_argv(), vec!["echo", "$(arg greeting)"]);

        let options = unit.options().unwrap();
        assert_eq!(options.output, "screen");
        assert_eq!(options.output_format, "{name}: {line}");
        assert!(options.cached_output);
        assert_eq!(options.sigterm_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.sigkill_timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.respawn, RespawnSetting::Expr("$(arg respawn)".into()));
        assert_eq!(options.respawn_delay, Some(Duration::from_millis(250)));
        assert_eq!(options.respawn_max_retries, 4);
        assert!(options.wait_on_child_processes);

        let description = unit.description();
        assert_eq!(description.cwd.as_deref(), Some("/tmp"));
        assert_eq!(description.additional_env["RUST_BACKTRACE"], "1");
    }

    #[test]
    fn test_defaults() {
        let unit = UnitFile::from_yaml("cmd: /bin/true\n").unwrap();
        let options = unit.options().unwrap();
        assert_eq!(options.output, "log");
        assert_eq!(options.output_format, DEFAULT_OUTPUT_FORMAT);
        assert_eq!(options.respawn, RespawnSetting::Bool(false));
        assert_eq!(options.respawn_max_retries, -1);
        assert_eq!(options.sigterm_timeout, None);
        assert!(!options.cached_output);
    }

    #[test]
    fn test_command_line_is_split() {
        let unit = UnitFile::from_yaml("cmd: sleep  10\n").unwrap();
        assert_eq!(unit.cmd.to_argv(), vec!["sleep", "10"]);
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            UnitFile::from_yaml("cmd: []\n"),
            Err(UnitFileError::Validation(_))
        ));
        assert!(matches!(
            UnitFile::from_yaml("cmd: /bin/true\noutput: printer\n"),
            Err(UnitFileError::Validation(_))
        ));
        assert!(matches!(
            UnitFile::from_yaml("cmd: /bin/true\nsigterm_timeout: -1\n"),
            Err(UnitFileError::Validation(_))
        ));
        assert!(matches!(
            UnitFile::from_yaml("cmd: /bin/true\nrespawn_dealy: 1\n"),
            Err(UnitFileError::Parse(_))
        ));
    }

    #[test]
    fn test_launch_configurations_merge() {
        let yaml = r#"
args:
  greeting:
    default: hello
  verbose:
    default: false
  target:
    description: required
cmd: /bin/true
"#;
        let unit = UnitFile::from_yaml(yaml).unwrap();

        assert!(matches!(
            unit.launch_configurations(&HashMap::new()),
            Err(UnitFileError::Validation(_))
        ));

        let overrides: HashMap<String, String> = [
            ("target".to_string(), "robot".to_string()),
            ("greeting".to_string(), "hi".to_string()),
            ("extra".to_string(), "1".to_string()),
        ]
        .into_iter()
        .collect();
        let configs = unit.launch_configurations(&overrides).unwrap();
        assert_eq!(configs["greeting"], "hi");
        assert_eq!(configs["verbose"], "false");
        assert_eq!(configs["target"], "robot");
        assert_eq!(configs["extra"], "1");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name: ticker\ncmd: [\"date\"]").unwrap();

        let unit = UnitFile::from_file(file.path()).unwrap();
        assert_eq!(unit.name.as_deref(), Some("ticker"));

        assert!(matches!(
            UnitFile::from_file("/nonexistent/unit.yaml"),
            Err(UnitFileError::Io { .. })
        ));
    }
}
