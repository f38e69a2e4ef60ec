//! Pseudo-terminal output for tty emulation (unix only)

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;

/// A freshly opened pseudo-terminal: the slave end goes to the child
pub struct Pty {
    pub reader: PtyReader,
    pub slave: OwnedFd,
}

/// Non-blocking reader over a pseudo-terminal master
pub struct PtyReader {
    inner: AsyncFd<File>,
}

/// Open a pseudo-terminal pair. Must be called within a tokio runtime.
pub fn open() -> io::Result<Pty> {
    let pty = openpty(None, None).map_err(io::Error::from)?;

    let master_fd = pty.master.as_raw_fd();
    let flags = fcntl(master_fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    fcntl(
        master_fd,
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )
    .map_err(io::Error::from)?;

    Ok(Pty {
        reader: PtyReader {
            inner: AsyncFd::new(File::from(pty.master))?,
        },
        slave: pty.slave,
    })
}

impl PtyReader {
    /// Read available bytes. Returns 0 once every slave descriptor is closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            let result = guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            });
            match result {
                // Linux reports a hung-up master as EIO rather than EOF
                Ok(Err(e)) if e.raw_os_error() == Some(Errno::EIO as i32) => return Ok(0),
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_slave_output_then_eof() {
        let Pty { mut reader, slave } = open().unwrap();

        let mut writer = File::from(slave);
        writer.write_all(b"hello\n").unwrap();
        drop(writer);

        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }

        // The line discipline translates \n into \r\n
        let text = String::from_utf8_lossy(&collected);
        assert!(text.starts_with("hello"), "unexpected pty output: {:?}", text);
    }
}
