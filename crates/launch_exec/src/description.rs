//! Process descriptions and their prepare-time resolution

use crate::config::{SubstitutionContext, SubstitutionError};
use crate::context::ExecutionContext;
use indexmap::IndexMap;
use std::path::PathBuf;

/// Unresolved description of a process to execute.
///
/// Every string may contain `$(arg ..)` / `$(env ..)` substitutions, which are
/// resolved against the execution context by [`ProcessDescription::prepare`].
#[derive(Debug, Clone, Default)]
pub struct ProcessDescription {
    /// Human-readable name; defaults to the executable's file name
    pub name: Option<String>,
    /// Executable followed by its arguments
    pub cmd: Vec<String>,
    /// Working directory
    pub cwd: Option<String>,
    /// Full environment replacing the inherited one
    pub env: Option<IndexMap<String, String>>,
    /// Variables added on top of the inherited (or replaced) environment
    pub additional_env: IndexMap<String, String>,
}

/// Fully resolved, immutable description of how to spawn one process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub cmd: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Complete child environment, `None` to inherit the host's unchanged
    pub env: Option<IndexMap<String, String>>,
    pub shell: bool,
    pub emulate_tty: bool,
}

impl ProcessSpec {
    /// Command line joined for display, skipping blank parts
    pub fn command_line(&self) -> String {
        self.cmd
            .iter()
            .filter(|part| !part.trim().is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ProcessDescription {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: IndexMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_additional_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_env.insert(name.into(), value.into());
        self
    }

    /// Resolve substitutions against the context's launch configurations.
    pub fn prepare(
        &self,
        ctx: &ExecutionContext,
        shell: bool,
        emulate_tty: bool,
    ) -> Result<ProcessSpec, DescriptionError> {
        let subst = SubstitutionContext::new().with_args(ctx.launch_configurations().clone());

        let cmd = subst
            .substitute_all(&self.cmd)
            .map_err(|e| DescriptionError::Substitution {
                field: "cmd".to_string(),
                source: e,
            })?;
        if cmd.is_empty() || cmd[0].trim().is_empty() {
            return Err(DescriptionError::EmptyCommand);
        }

        let name = match &self.name {
            Some(name) => subst
                .substitute(name)
                .map_err(|e| DescriptionError::Substitution {
                    field: "name".to_string(),
                    source: e,
                })?,
            None => default_name(&cmd[0]),
        };

        let cwd = match &self.cwd {
            Some(cwd) => Some(PathBuf::from(subst.substitute(cwd).map_err(|e| {
                DescriptionError::Substitution {
                    field: "cwd".to_string(),
                    source: e,
                }
            })?)),
            None => None,
        };

        let env = self.resolve_env(&subst)?;

        Ok(ProcessSpec {
            name,
            cmd,
            cwd,
            env,
            shell,
            emulate_tty,
        })
    }

    fn resolve_env(
        &self,
        subst: &SubstitutionContext,
    ) -> Result<Option<IndexMap<String, String>>, DescriptionError> {
        if self.env.is_none() && self.additional_env.is_empty() {
            return Ok(None);
        }

        let mut env: IndexMap<String, String> = match &self.env {
            Some(explicit) => {
                let mut resolved = IndexMap::new();
                for (k, v) in explicit {
                    resolved.insert(k.clone(), substitute_env_value(subst, k, v)?);
                }
                resolved
            }
            None => std::env::vars_os()
                .map(|(k, v)| {
                    (
                        k.to_string_lossy().into_owned(),
                        v.to_string_lossy().into_owned(),
                    )
                })
                .collect(),
        };

        for (k, v) in &self.additional_env {
            env.insert(k.clone(), substitute_env_value(subst, k, v)?);
        }

        Ok(Some(env))
    }
}

fn substitute_env_value(
    subst: &SubstitutionContext,
    key: &str,
    value: &str,
) -> Result<String, DescriptionError> {
    subst
        .substitute(value)
        .map_err(|e| DescriptionError::Substitution {
            field: format!("env '{}'", key),
            source: e,
        })
}

fn default_name(executable: &str) -> String {
    std::path::Path::new(executable)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string())
}

/// Errors that can occur while preparing a process description
#[derive(Debug, thiserror::Error)]
pub enum DescriptionError {
    #[error("Process command is empty")]
    EmptyCommand,

    #[error("Substitution failed in {field}: {source}")]
    Substitution {
        field: String,
        #[source]
        source: SubstitutionError,
    },
}
