//! A child process attached to the slave end of a fresh pseudo-terminal.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::{ExitStatus, Stdio};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};

use crate::error::{Result, TerminalError};

const READ_CHUNK: usize = 4096;

pub struct PtyProcess {
    master: AsyncFd<File>,
    child: Child,
}

impl PtyProcess {
    /// Open a pty pair and spawn `cmd` on its slave end. The parent keeps
    /// only the master, so reads fail once the child side is gone.
    pub fn spawn(mut cmd: Command) -> Result<Self> {
        let pty = openpty(None, None)?;
        fcntl(pty.master.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        let slave: OwnedFd = pty.slave;
        cmd.stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave))
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(TerminalError::Spawn)?;
        let master = AsyncFd::new(File::from(pty.master))?;

        Ok(Self { master, child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next chunk of output. An empty chunk means the terminal is closed.
    pub async fn read_chunk(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let mut guard = self.master.readable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(&mut buf)
            }) {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                // Linux reports a hung-up master as EIO
                Ok(Err(e)) if e.raw_os_error() == Some(nix::libc::EIO) => return Ok(Vec::new()),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write as much of `data` as the terminal takes in one go.
    pub async fn write_some(&self, data: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(data)
            }) {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Kill the child if it is still running and reap it.
    pub async fn terminate(mut self) -> io::Result<ExitStatus> {
        if self.child.try_wait()?.is_none() {
            // already exited between the check and the kill is fine
            let _ = self.child.start_kill();
        }
        self.child.wait().await
    }
}
