//! `ignite run`: launch one service and report the outcome.

use std::fs;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use ignite::{Os, ServiceConfig, StatusReport, Sys};
use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use tracing::{debug, info};

/// Arguments for `ignite run`.
#[derive(clap::Args)]
pub struct RunArgs {
    /// Path to the service description (JSON).
    service: PathBuf,

    /// Run attached to the console instead of detached.
    #[arg(long)]
    console: bool,

    /// Take the terminal's foreground process group (implies --console).
    #[arg(long)]
    foreground: bool,

    /// Wait for the service to exit and propagate its exit status.
    #[arg(long)]
    wait: bool,
}

/// Descriptors the parent opens for the child and closes after fork.
#[derive(Default)]
struct Handover {
    /// Inheritable write end of the readiness pipe, and our read end.
    notify: Option<(RawFd, RawFd)>,
    /// Inheritable listening socket.
    activation: Option<RawFd>,
    /// Inheritable child end of the control connection.
    control: Option<RawFd>,
    /// Keeps our end of the control connection open while the service runs.
    control_peer: Option<UnixStream>,
}

impl Handover {
    /// Closes everything that belongs to the child.
    fn release(&mut self, os: &mut Os) {
        let child_fds = [
            self.notify.map(|(write, _)| write),
            self.activation.take(),
            self.control.take(),
        ];
        for fd in child_fds.into_iter().flatten() {
            let _ = os.close(fd);
        }
    }
}

impl RunArgs {
    pub fn run(self) -> Result<i32> {
        let config = ServiceConfig::load(&self.service)
            .with_context(|| format!("failed to load {}", self.service.display()))?;
        let mut os = Os::new();
        let mut handover = Handover::default();

        let mut builder = config.to_builder()?;
        if self.console || self.foreground {
            builder = builder.on_console(true).in_foreground(self.foreground);
        }

        if config.notification()?.is_some() {
            let (read_fd, write_fd) = os.pipe().context("failed to create readiness pipe")?;
            let inheritable = inheritable(&mut os, write_fd)?;
            let _ = os.close(write_fd);
            handover.notify = Some((inheritable, read_fd));
            builder = builder.notify_fd(inheritable);
        }

        let listener = match &config.socket_listen {
            Some(path) => {
                let listener = listen(path)?;
                let fd = inheritable(&mut os, listener.as_raw_fd())?;
                handover.activation = Some(fd);
                builder = builder.activation_socket(fd);
                Some(listener)
            }
            None => None,
        };

        if config.pass_control_socket {
            let (ours, theirs) = UnixStream::pair().context("failed to create control socket")?;
            let fd = inheritable(&mut os, theirs.as_raw_fd())?;
            handover.control = Some(fd);
            handover.control_peer = Some(ours);
            builder = builder.control_socket(fd);
        }

        let spawned = ignite::spawn(&mut os, builder);
        handover.release(&mut os);
        drop(listener);
        let mut handle = spawned?;
        let pid = handle.pid();

        match handle.wait_outcome(&mut os)? {
            StatusReport::Started => {}
            StatusReport::Failed(failure) => {
                close_notify_read(&mut os, &handover);
                bail!("{}: {failure}", config.command[0]);
            }
            _ => {
                close_notify_read(&mut os, &handover);
                bail!("{}: launch failed for an unknown reason", config.command[0]);
            }
        }
        println!("started {} (pid {pid})", config.command[0]);

        if let Some((_, read_fd)) = handover.notify {
            let ready = wait_ready(&mut os, read_fd);
            let _ = os.close(read_fd);
            if ready? {
                println!("{} is ready", config.command[0]);
            } else {
                bail!("{} closed its readiness pipe without signalling", config.command[0]);
            }
        }

        if !self.wait {
            return Ok(0);
        }
        let code = match waitpid(pid, None).context("waitpid")? {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
            other => {
                debug!(?other, "unexpected wait status");
                1
            }
        };
        info!(pid = pid.as_raw(), code, "service exited");
        drop(handover.control_peer);
        Ok(code)
    }
}

/// Returns an inheritable duplicate of `fd` at or above 3.
fn inheritable(os: &mut Os, fd: RawFd) -> Result<RawFd> {
    os.dup_min(fd, 3, false)
        .context("failed to duplicate descriptor for the service")
}

/// Binds `path`, replacing a stale socket left by an earlier run.
fn listen(path: &Path) -> Result<UnixListener> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            debug!(path = %path.display(), "removing stale socket");
            fs::remove_file(path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    UnixListener::bind(path).with_context(|| format!("failed to listen on {}", path.display()))
}

fn close_notify_read(os: &mut Os, handover: &Handover) {
    if let Some((_, read_fd)) = handover.notify {
        let _ = os.close(read_fd);
    }
}

/// Blocks until a full line arrives on the readiness pipe.
///
/// `false` on end-of-stream, including after a partial line.
fn wait_ready<S: Sys + ?Sized>(sys: &mut S, fd: RawFd) -> Result<bool> {
    let mut byte = [0u8; 1];
    loop {
        match sys.read(fd, &mut byte) {
            Ok(0) => return Ok(false),
            Ok(_) if byte[0] == b'\n' => return Ok(true),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(e).context("failed to read readiness pipe"),
        }
    }
}
