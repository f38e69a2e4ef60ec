//! Process launcher: turns a resolved spec into a running child

use crate::description::ProcessSpec;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, Command};

/// Readable end of a child's stdout or stderr
pub enum OutputReader {
    Pipe(Box<dyn tokio::io::AsyncRead + Send + Unpin>),
    #[cfg(unix)]
    Pty(crate::runtime::pty::PtyReader),
}

impl OutputReader {
    /// Read the next chunk; 0 means end of stream
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            OutputReader::Pipe(reader) => reader.read(buf).await,
            #[cfg(unix)]
            OutputReader::Pty(reader) => reader.read(buf).await,
        }
    }
}

/// A spawned child with its stdio endpoints
pub struct SpawnedProcess {
    pub pid: u32,
    pub child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: OutputReader,
    pub stderr: OutputReader,
}

/// Build the command without stdio configuration
fn build_command(spec: &ProcessSpec) -> Result<Command, LaunchError> {
    let (program, args) = spec.cmd.split_first().ok_or(LaunchError::EmptyCommand)?;

    let mut cmd = if spec.shell {
        let line = spec.cmd.join(" ");
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(line);
            cmd
        } else {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(line);
            cmd
        }
    } else {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    };

    if let Some(env) = &spec.env {
        cmd.env_clear().envs(env);
    }
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::piped()).kill_on_drop(true);

    Ok(cmd)
}

/// Spawn the process described by `spec`. Must be called within a tokio
/// runtime. Errors are returned as-is; there is no retry.
pub fn spawn(spec: &ProcessSpec) -> Result<SpawnedProcess, LaunchError> {
    let mut cmd = build_command(spec)?;

    let (stdout, stderr) = attach_output(&mut cmd, spec)?;

    let spawned = cmd.spawn();
    // The command keeps any pty slaves open; release them so EOF is seen
    // once the child and its descendants close theirs
    drop(cmd);

    let mut child = spawned.map_err(|e| LaunchError::Spawn {
        command: spec.command_line(),
        source: e,
    })?;

    let pid = child.id().unwrap_or(0);
    let stdin = child.stdin.take();
    let stdout = match stdout {
        Some(reader) => reader,
        None => pipe_reader(child.stdout.take())?,
    };
    let stderr = match stderr {
        Some(reader) => reader,
        None => pipe_reader(child.stderr.take())?,
    };

    Ok(SpawnedProcess {
        pid,
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Return code of an exited child: the exit code, or `-N` when it was
/// terminated by signal N
pub fn returncode(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|signal| -signal))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

fn pipe_reader<R>(stream: Option<R>) -> Result<OutputReader, LaunchError>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    stream
        .map(|s| OutputReader::Pipe(Box::new(s)))
        .ok_or(LaunchError::MissingStream)
}

/// Configure stdout/stderr. Returns pty readers when tty emulation is on,
/// `None` for streams that are plain pipes.
#[cfg(unix)]
fn attach_output(
    cmd: &mut Command,
    spec: &ProcessSpec,
) -> Result<(Option<OutputReader>, Option<OutputReader>), LaunchError> {
    use crate::runtime::pty;

    if !spec.emulate_tty {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        return Ok((None, None));
    }

    let out = pty::open().map_err(LaunchError::Pty)?;
    let err = pty::open().map_err(LaunchError::Pty)?;
    cmd.stdout(Stdio::from(out.slave)).stderr(Stdio::from(err.slave));
    Ok((
        Some(OutputReader::Pty(out.reader)),
        Some(OutputReader::Pty(err.reader)),
    ))
}

#[cfg(not(unix))]
fn attach_output(
    cmd: &mut Command,
    spec: &ProcessSpec,
) -> Result<(Option<OutputReader>, Option<OutputReader>), LaunchError> {
    if spec.emulate_tty {
        log::warn!(
            "[{}] tty emulation is not supported on this platform, using pipes",
            spec.name
        );
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    Ok((None, None))
}

/// Errors that can occur while launching a process
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Process command is empty")]
    EmptyCommand,

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to allocate a pseudo-terminal: {0}")]
    Pty(#[source] io::Error),

    #[error("Spawned process is missing a standard stream")]
    MissingStream,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cmd: &[&str]) -> ProcessSpec {
        ProcessSpec {
            name: "test".to_string(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: None,
            shell: false,
            emulate_tty: false,
        }
    }

    async fn read_all(reader: &mut OutputReader) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = reader.read_chunk(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_spawn_captures_both_streams() {
        let mut p = spawn(&spec(&["/bin/sh", "-c", "echo out; echo err >&2"])).unwrap();
        assert!(p.pid > 0);
        assert_eq!(read_all(&mut p.stdout).await, "out\n");
        assert_eq!(read_all(&mut p.stderr).await, "err\n");
        assert!(p.child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_shell_mode_and_cwd_and_env() {
        let mut s = spec(&["pwd;", "echo", "$GREETING"]);
        s.shell = true;
        s.cwd = Some("/".into());
        let mut env = indexmap::IndexMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        s.env = Some(env);

        let mut p = spawn(&s).unwrap();
        assert_eq!(read_all(&mut p.stdout).await, "/\nhi\n");
        p.child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable_is_reported() {
        let result = spawn(&spec(&["/definitely/not/a/real/binary"]));
        assert!(matches!(result, Err(LaunchError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_returncode_of_signalled_child() {
        let mut p = spawn(&spec(&["/bin/sh", "-c", "kill -9 $$"])).unwrap();
        let status = p.child.wait().await.unwrap();
        assert_eq!(returncode(status), Some(-9));

        let mut p = spawn(&spec(&["/bin/sh", "-c", "exit 3"])).unwrap();
        let status = p.child.wait().await.unwrap();
        assert_eq!(returncode(status), Some(3));
    }

    #[tokio::test]
    async fn test_empty_command() {
        assert!(matches!(spawn(&spec(&[])), Err(LaunchError::EmptyCommand)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_emulated_tty_is_a_terminal() {
        let mut s = spec(&["/bin/sh", "-c", "test -t 1 && echo tty"]);
        s.emulate_tty = true;
        let mut p = spawn(&s).unwrap();
        let out = read_all(&mut p.stdout).await;
        assert_eq!(out.trim_end(), "tty");
        p.child.wait().await.unwrap();
    }
}
