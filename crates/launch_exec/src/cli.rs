//! Command-line interface for launch_exec

use argh::FromArgs;
use std::collections::HashMap;

/// Run and supervise one local process described by a unit file
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// path to the unit file
    #[argh(positional)]
    pub unit_file: String,

    /// override launch arguments (format: key:=value)
    #[argh(option, short = 'a', from_str_fn(parse_arg_override))]
    pub arg: Vec<(String, String)>,

    /// deliver SIGINT to the process on Ctrl+C (no terminal in front of it)
    #[argh(switch)]
    pub noninteractive: bool,

    /// print the resolved process without executing it
    #[argh(switch)]
    pub dry_run: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse argument override in format "key:=value"
fn parse_arg_override(s: &str) -> Result<(String, String), String> {
    match s.split_once(":=") {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!(
            "Invalid argument format '{}'. Expected 'key:=value'",
            s
        )),
    }
}

/// Normalize a log level name, falling back to `info`
pub fn log_filter(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

impl LaunchArgs {
    /// Convert argument overrides to a HashMap
    pub fn arg_overrides(&self) -> HashMap<String, String> {
        self.arg.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_override() {
        let result = parse_arg_override("robot:=turtle");
        assert_eq!(result, Ok(("robot".to_string(), "turtle".to_string())));
    }

    #[test]
    fn test_parse_arg_override_with_separator_in_value() {
        let result = parse_arg_override("uri:=tcp://localhost:7447");
        assert_eq!(result, Ok(("uri".to_string(), "tcp://localhost:7447".to_string())));
    }

    #[test]
    fn test_parse_arg_override_invalid() {
        assert!(parse_arg_override("invalid").is_err());
        assert!(parse_arg_override(":=value").is_err());
    }

    #[test]
    fn test_args_from_command_line() {
        let args = LaunchArgs::from_args(
            &["launch_exec"],
            &["unit.yaml", "-a", "robot:=turtle", "--noninteractive", "-l", "debug"],
        )
        .unwrap();
        assert_eq!(args.unit_file, "unit.yaml");
        assert!(args.noninteractive);
        assert!(!args.dry_run);
        assert_eq!(args.arg_overrides()["robot"], "turtle");
        assert_eq!(log_filter(&args.log_level), "debug");
        assert_eq!(log_filter("loud"), "info");
    }
}
