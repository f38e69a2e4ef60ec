//! Substitution engine for `$(arg ..)`, `$(var ..)` and `$(env ..)` patterns

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Regex for matching substitution patterns: $(type value)
static SUBSTITUTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\((\w+)\s+([^)]+)\)|\$\((\w+)\)").unwrap());

/// Upper bound on nested substitution passes
const MAX_ITERATIONS: usize = 10;

/// Substitution context containing all available variables
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Launch configurations (`$(arg name)` / `$(var name)`)
    pub args: HashMap<String, String>,
    /// Environment overrides consulted before the process environment
    pub env: HashMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Add multiple arguments
    pub fn with_args(mut self, args: HashMap<String, String>) -> Self {
        self.args.extend(args);
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Substitute all patterns in a string
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut result = input.to_string();
        let mut last_result = String::new();
        let mut iterations = 0;

        // Values may themselves contain patterns
        while result != last_result && iterations < MAX_ITERATIONS {
            last_result = result.clone();
            result = self.substitute_once(&result)?;
            iterations += 1;
        }

        if iterations >= MAX_ITERATIONS && SUBSTITUTION_PATTERN.is_match(&result) {
            return Err(SubstitutionError::MaxIterationsExceeded(input.to_string()));
        }

        Ok(result)
    }

    /// Substitute every element of a list
    pub fn substitute_all(&self, inputs: &[String]) -> Result<Vec<String>, SubstitutionError> {
        inputs.iter().map(|s| self.substitute(s)).collect()
    }

    fn substitute_once(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut error: Option<SubstitutionError> = None;

        let result = SUBSTITUTION_PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }

            match self.resolve_capture(caps) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        Ok(result.into_owned())
    }

    fn resolve_capture(&self, caps: &Captures) -> Result<String, SubstitutionError> {
        // $(type value), e.g. $(arg rate)
        if let (Some(subst_type), Some(value)) = (caps.get(1), caps.get(2)) {
            return self.resolve_typed(subst_type.as_str(), value.as_str().trim());
        }

        // $(type) has no argument-free forms
        if let Some(subst_type) = caps.get(3) {
            return Err(SubstitutionError::MissingValue(subst_type.as_str().to_string()));
        }

        Err(SubstitutionError::InvalidPattern(
            caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
        ))
    }

    fn resolve_typed(&self, subst_type: &str, value: &str) -> Result<String, SubstitutionError> {
        match subst_type {
            "arg" | "var" => self.resolve_arg(value),
            "env" => self.resolve_env(value),
            _ => Err(SubstitutionError::UnknownType(subst_type.to_string())),
        }
    }

    fn resolve_arg(&self, name: &str) -> Result<String, SubstitutionError> {
        self.args
            .get(name)
            .cloned()
            .ok_or_else(|| SubstitutionError::UndefinedArg(name.to_string()))
    }

    /// `$(env NAME)` or `$(env NAME default words)`
    fn resolve_env(&self, value: &str) -> Result<String, SubstitutionError> {
        let (name, default) = match value.split_once(char::is_whitespace) {
            Some((name, default)) => (name, Some(default.trim())),
            None => (value, None),
        };

        if let Some(value) = self.env.get(name) {
            return Ok(value.clone());
        }

        match (std::env::var(name), default) {
            (Ok(value), _) => Ok(value),
            (Err(_), Some(default)) => Ok(default.to_string()),
            (Err(_), None) => Err(SubstitutionError::UndefinedEnv(name.to_string())),
        }
    }
}

/// Interpret a resolved string as a boolean launch configuration
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Errors that can occur during substitution
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown substitution type: {0}")]
    UnknownType(String),

    #[error("Substitution '$({0})' requires a value")]
    MissingValue(String),

    #[error("Undefined argument: {0}")]
    UndefinedArg(String),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Invalid substitution pattern: {0}")]
    InvalidPattern(String),

    #[error("Maximum substitution iterations exceeded for: {0}")]
    MaxIterationsExceeded(String),
}
