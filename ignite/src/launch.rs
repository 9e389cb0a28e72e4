//! The child bootstrap sequence.
//!
//! Runs in the forked child and walks [`LaunchStage`] in order. Every
//! stage is a fallible step; the first failure is tagged with its stage,
//! written to the status pipe, and the child exits without running exit
//! handlers. Nothing here logs, panics, or allocates except while loading
//! an environment file.

use std::os::fd::RawFd;

use ignite_proto::{LaunchFailure, LaunchStage};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{SigSet, SigmaskHow, Signal};
use nix::sys::stat::Mode;
use nix::unistd::Pid;

use crate::env::{self, ACTIVATION_FD, LISTEN_FDS};
use crate::fdops::{move_descriptor, relocate_reserved};
use crate::limits;
use crate::report;
use crate::request::LaunchRequest;
use crate::sys::Sys;

/// Signals left deliverable once the bootstrap hands over to the program.
const UNBLOCKED_AFTER_EXEC: [Signal; 4] = [
    Signal::SIGCHLD,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
];

/// Drives `req` through every stage and replaces the process image.
///
/// With [`Os`](crate::Os) this never returns. With a substitute boundary it
/// returns `Ok(())` once `execvp` reports success, or `Err` after the failure
/// record has been written and `exit_immediately` called.
pub fn run_child<S: Sys + ?Sized>(sys: &mut S, req: LaunchRequest) -> Result<(), LaunchFailure> {
    let mut child = Child::new(sys, req);
    match child.bootstrap() {
        Ok(()) => Ok(()),
        Err(failure) => {
            report::send_failure(child.sys, child.status_fd, failure);
            Err(failure)
        }
    }
}

/// Tags an errno with the stage that produced it.
fn at(stage: LaunchStage) -> impl Fn(Errno) -> LaunchFailure {
    move |errno| LaunchFailure::new(stage, errno as i32)
}

/// Converts a non-negative descriptor or pid for an environment value.
fn env_number(n: i32) -> nix::Result<u32> {
    u32::try_from(n).map_err(|_| Errno::EINVAL)
}

/// Mutable bootstrap state: the request plus current descriptor placement.
struct Child<'a, S: Sys + ?Sized> {
    sys: &'a mut S,
    req: LaunchRequest,
    status_fd: RawFd,
    control_fd: Option<RawFd>,
    notify_fd: Option<RawFd>,
    activation_fd: Option<RawFd>,
    /// Mask reinstated just before exec.
    restore_mask: SigSet,
    /// Console mode: no session owns the terminal yet, so claim it.
    claim_terminal: bool,
    /// Standard slots closed while arranging descriptors.
    vacated: [bool; 3],
}

impl<'a, S: Sys + ?Sized> Child<'a, S> {
    fn new(sys: &'a mut S, req: LaunchRequest) -> Self {
        let claim_terminal = req.on_console && sys.tcgetsid(0).is_err();

        // Block everything until exec; descriptor calls can be interrupted.
        let mut restore_mask = sys
            .sigprocmask(SigmaskHow::SIG_SETMASK, &SigSet::all())
            .unwrap_or_else(|_| SigSet::empty());
        for sig in UNBLOCKED_AFTER_EXEC {
            restore_mask.remove(sig);
        }

        Self {
            status_fd: req.status_pipe_fd,
            control_fd: req.control_socket_fd,
            notify_fd: req.notify_fd,
            activation_fd: req.activation_socket_fd,
            sys,
            req,
            restore_mask,
            claim_terminal,
            vacated: [false; 3],
        }
    }

    fn bootstrap(&mut self) -> Result<(), LaunchFailure> {
        self.arrange_fds().map_err(at(LaunchStage::ArrangeFds))?;

        if let Some(path) = &self.req.env_file {
            env::load_env_file(self.sys, path).map_err(at(LaunchStage::ReadEnvFile))?;
        }

        self.export_notify_var().map_err(at(LaunchStage::SetNotifyFdVar))?;
        self.setup_activation_socket()
            .map_err(at(LaunchStage::SetupActivationSocket))?;
        self.export_control_socket()
            .map_err(at(LaunchStage::SetupControlSocket))?;

        if let Some(dir) = &self.req.working_dir {
            self.sys.chdir(dir).map_err(at(LaunchStage::Chdir))?;
        }

        if self.req.on_console {
            self.attach_console();
        } else {
            self.close_std_slots();
            self.setup_stdio().map_err(at(LaunchStage::SetupStdio))?;
            let _ = self.sys.setsid();
        }

        limits::apply(self.sys, &self.req.rlimits).map_err(at(LaunchStage::SetRlimits))?;

        self.drop_privileges().map_err(at(LaunchStage::SetUidGid))?;

        let _ = self.sys.sigprocmask(SigmaskHow::SIG_SETMASK, &self.restore_mask);

        self.sys.execvp(&self.req.argv).map_err(at(LaunchStage::DoExec))
    }

    /// Records that `fd` was closed if it is a standard slot.
    fn note_closed(&mut self, fd: RawFd) {
        if let Some(slot) = usize::try_from(fd).ok().and_then(|i| self.vacated.get_mut(i)) {
            *slot = true;
        }
    }

    fn arrange_fds(&mut self) -> nix::Result<()> {
        let min_fd = if self.activation_fd.is_some() { ACTIVATION_FD + 1 } else { ACTIVATION_FD };

        if let Some(pinned) = self.req.pinned_notify_fd {
            if self.status_fd == pinned {
                relocate_reserved(self.sys, &mut self.status_fd, min_fd, true)?;
            }
            if let Some(fd) = self.control_fd.as_mut().filter(|fd| **fd == pinned) {
                relocate_reserved(self.sys, fd, min_fd, false)?;
            }
            if let Some(fd) = self.activation_fd.as_mut().filter(|fd| **fd == pinned) {
                // Kept off the activation slot so the later dup2 clears close-on-exec.
                relocate_reserved(self.sys, fd, ACTIVATION_FD + 1, true)?;
            }
            if let Some(notify) = self.notify_fd.filter(|&fd| fd != pinned) {
                move_descriptor(self.sys, Some(notify), pinned)?;
                self.note_closed(notify);
                self.notify_fd = Some(pinned);
            }
        }

        if self.status_fd < min_fd {
            self.status_fd = self.sys.dup_min(self.status_fd, min_fd, true)?;
        }
        if let Some(fd) = self.control_fd.filter(|&fd| fd < min_fd) {
            self.control_fd = Some(self.sys.dup_min(fd, min_fd, false)?);
        }
        if self.req.pinned_notify_fd.is_none() {
            if let Some(fd) = self.notify_fd.filter(|&fd| fd < min_fd) {
                self.notify_fd = Some(self.sys.dup_min(fd, min_fd, false)?);
            }
        }
        Ok(())
    }

    fn export_notify_var(&mut self) -> nix::Result<()> {
        let (Some(var), Some(fd)) = (self.req.notify_var.take(), self.notify_fd) else {
            return Ok(());
        };
        self.sys.putenv(var.fill(env_number(fd)?)?)
    }

    fn setup_activation_socket(&mut self) -> nix::Result<()> {
        let Some(fd) = self.activation_fd else {
            return Ok(());
        };
        move_descriptor(self.sys, Some(fd), ACTIVATION_FD)?;
        if fd != ACTIVATION_FD {
            self.note_closed(fd);
        }
        self.activation_fd = Some(ACTIVATION_FD);

        self.sys.putenv(LISTEN_FDS)?;
        if let Some(var) = self.req.listen_pid_var.take() {
            let pid = self.sys.getpid();
            self.sys.putenv(var.fill(env_number(pid.as_raw())?)?)?;
        }
        Ok(())
    }

    fn export_control_socket(&mut self) -> nix::Result<()> {
        let (Some(var), Some(fd)) = (self.req.control_var.take(), self.control_fd) else {
            return Ok(());
        };
        self.sys.putenv(var.fill(env_number(fd)?)?)
    }

    /// Closes 0..=2 except a pinned notification slot and slots already vacated.
    fn close_std_slots(&mut self) {
        for fd in 0..3 {
            let vacated = usize::try_from(fd)
                .ok()
                .and_then(|i| self.vacated.get(i).copied())
                .unwrap_or(false);
            if Some(fd) != self.req.pinned_notify_fd && !vacated {
                let _ = self.sys.close(fd);
                self.note_closed(fd);
            }
        }
    }

    /// Reopens stdin from `/dev/null` and stdout/stderr from the log target,
    /// leaving whichever slot holds the notification descriptor alone.
    fn setup_stdio(&mut self) -> nix::Result<()> {
        let notify = self.notify_fd;
        if notify != Some(0) {
            let fd = self.sys.open(c"/dev/null", OFlag::O_RDONLY, Mode::empty())?;
            move_descriptor(self.sys, Some(fd), 0)?;
        }

        let log_flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND;
        let log_mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let log_slot = if notify == Some(1) { 2 } else { 1 };
        let fd = self.sys.open(&self.req.log_target, log_flags, log_mode)?;
        move_descriptor(self.sys, Some(fd), log_slot)?;
        if log_slot == 1 && notify != Some(2) {
            self.sys.dup2(1, 2)?;
        }
        Ok(())
    }

    /// Console mode. Failures here are not fatal.
    fn attach_console(&mut self) {
        if self.claim_terminal {
            let _ = self.sys.ignore_signal(Signal::SIGTSTP);
            let _ = self.sys.setsid();
            let _ = self.sys.set_controlling_terminal(0);
        }
        let _ = self.sys.setpgid(Pid::from_raw(0), Pid::from_raw(0));
        if self.req.in_foreground {
            let pgrp = self.sys.getpgrp();
            let _ = self.sys.tcsetpgrp(0, pgrp);
        }
    }

    /// Group before user.
    fn drop_privileges(&mut self) -> nix::Result<()> {
        if let Some(gid) = self.req.gid {
            self.sys.setregid(gid)?;
        }
        if let Some(uid) = self.req.uid {
            self.sys.setreuid(uid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ignite_proto::StatusReport;
    use nix::sys::resource::Resource;
    use nix::unistd::{Gid, Uid};

    use super::*;
    use crate::fake::{Call, FakeSys, Op};
    use crate::limits::{ResourceLimit, Rlimit};
    use crate::request::LaunchRequestBuilder;

    /// A fake process holding a status pipe write end, plus the request for it.
    fn setup(
        build: impl FnOnce(LaunchRequestBuilder) -> LaunchRequestBuilder,
    ) -> (FakeSys, RawFd, LaunchRequest) {
        let mut sys = FakeSys::new();
        let (_read, write) = sys.pipe().unwrap();
        let builder = LaunchRequest::builder(["/bin/true"]).status_pipe(write);
        let req = build(builder).build().unwrap();
        (sys, write, req)
    }

    fn report(sys: &FakeSys, fd: RawFd) -> StatusReport {
        StatusReport::classify(sys.written(fd))
    }

    #[test]
    fn plain_launch_reaches_exec_without_report() {
        let (mut sys, status, req) = setup(|b| b);
        assert_eq!(run_child(&mut sys, req), Ok(()));

        assert_eq!(sys.exec_argv().unwrap(), ["/bin/true"]);
        assert!(sys.written(status).is_empty());
        assert_eq!(sys.exit_status(), None);
        // Status pipe is close-on-exec, stdio reopened.
        assert!(!sys.is_open(status));
        assert_eq!(sys.open_fds(), vec![0, 1, 2]);
        assert_eq!(sys.session().0, Pid::from_raw(100));
    }

    #[test]
    fn missing_working_dir_reports_chdir() {
        let (mut sys, status, req) = setup(|b| b.working_dir("/nonexistent"));
        sys.fail_next(Op::Chdir, Errno::ENOENT);

        let failure = run_child(&mut sys, req).unwrap_err();
        assert_eq!(failure, LaunchFailure::new(LaunchStage::Chdir, Errno::ENOENT as i32));
        assert_eq!(report(&sys, status), StatusReport::Failed(failure));
        assert_eq!(sys.written(status).len(), ignite_proto::RECORD_LEN);
        assert_eq!(sys.exit_status(), Some(0));
        assert!(sys.exec_argv().is_none());
    }

    #[test]
    fn exec_failure_is_reported() {
        let (mut sys, status, req) = setup(|b| b);
        sys.fail_next(Op::Execvp, Errno::ENOENT);
        run_child(&mut sys, req).unwrap_err();
        assert_eq!(
            report(&sys, status),
            StatusReport::Failed(LaunchFailure::new(LaunchStage::DoExec, Errno::ENOENT as i32))
        );
    }

    #[test]
    fn short_record_write_is_not_retried() {
        let (mut sys, status, req) = setup(|b| b);
        sys.limit_writes(status, 3);
        sys.fail_next(Op::Execvp, Errno::EACCES);
        run_child(&mut sys, req).unwrap_err();
        assert_eq!(report(&sys, status), StatusReport::Garbled { len: 3 });
    }

    #[test]
    fn pinned_slot_evicts_status_pipe_first() {
        let mut sys = FakeSys::new();
        let (_read, status) = sys.pipe().unwrap();
        let notify = sys.alloc_fd();
        let req = LaunchRequest::builder(["svc"])
            .status_pipe(status)
            .notify_fd(notify)
            .pinned_notify_fd(status)
            .notify_var("NOTIFY_FD")
            .build()
            .unwrap();
        sys.fail_next(Op::Execvp, Errno::ENOENT);
        run_child(&mut sys, req).unwrap_err();

        let evict = sys
            .position(|c| matches!(c, Call::DupMin { fd, .. } if *fd == status))
            .unwrap();
        let promote = sys
            .position(|c| *c == Call::Dup2(notify, status))
            .unwrap();
        assert!(evict < promote);

        let Some(Call::DupMin { new_fd, cloexec, .. }) = sys.calls().get(evict).cloned() else {
            unreachable!()
        };
        assert!(new_fd >= 3 && cloexec);
        assert!(sys.is_open(status));
        assert!(!sys.is_open(notify));
        assert_eq!(sys.env("NOTIFY_FD"), Some(status.to_string().as_str()));
        // The record went to the relocated pipe.
        assert_eq!(sys.written(new_fd).len(), ignite_proto::RECORD_LEN);
    }

    #[test]
    fn activation_socket_lands_on_slot_three() {
        let mut sys = FakeSys::new();
        let (_read, status) = sys.pipe().unwrap();
        let socket = sys.alloc_fd();
        let control = sys.alloc_fd();
        let req = LaunchRequest::builder(["svc"])
            .status_pipe(status)
            .activation_socket(socket)
            .control_socket(control)
            .build()
            .unwrap();
        run_child(&mut sys, req).unwrap();

        assert!(sys.is_open(ACTIVATION_FD));
        assert!(!sys.is_open(socket));
        assert_eq!(sys.env("LISTEN_FDS"), Some("1"));
        assert_eq!(sys.env("LISTEN_PID"), Some("100"));
        assert_eq!(sys.env("IGNITE_CS_FD"), Some(control.to_string().as_str()));
        assert!(sys.is_open(control));
        assert!(!sys.is_cloexec(control));
    }

    #[test]
    fn activation_socket_on_pinned_slot_survives_exec() {
        let mut sys = FakeSys::new();
        let (read, status) = sys.pipe().unwrap();
        let notify = sys.alloc_fd();
        let socket = sys.alloc_fd();
        sys.close(read).unwrap();
        let req = LaunchRequest::builder(["svc"])
            .status_pipe(status)
            .notify_fd(notify)
            .pinned_notify_fd(socket)
            .notify_var("NOTIFY_FD")
            .activation_socket(socket)
            .build()
            .unwrap();
        run_child(&mut sys, req).unwrap();

        let evict = sys
            .calls()
            .iter()
            .find(|c| matches!(c, Call::DupMin { fd, .. } if *fd == socket))
            .cloned();
        let Some(Call::DupMin { min, .. }) = evict else {
            unreachable!()
        };
        assert_eq!(min, ACTIVATION_FD + 1);
        assert!(sys.is_open(ACTIVATION_FD));
        assert_eq!(sys.open_fds(), vec![0, 1, 2, ACTIVATION_FD, socket]);
        assert_eq!(sys.env("NOTIFY_FD"), Some(socket.to_string().as_str()));
        assert_eq!(sys.env("LISTEN_FDS"), Some("1"));
    }

    #[test]
    fn status_pipe_on_activation_slot_is_raised() {
        let mut sys = FakeSys::new();
        let (status, _write) = sys.pipe().unwrap();
        assert_eq!(status, ACTIVATION_FD);
        let socket = sys.alloc_fd();
        let req = LaunchRequest::builder(["svc"])
            .status_pipe(status)
            .activation_socket(socket)
            .build()
            .unwrap();
        sys.fail_next(Op::Execvp, Errno::ENOENT);
        run_child(&mut sys, req).unwrap_err();

        let raise = sys
            .calls()
            .iter()
            .find(|c| matches!(c, Call::DupMin { fd, .. } if *fd == status))
            .cloned();
        let Some(Call::DupMin { min, cloexec, new_fd, .. }) = raise else {
            unreachable!()
        };
        assert_eq!(min, ACTIVATION_FD + 1);
        assert!(cloexec && new_fd > ACTIVATION_FD);
        assert!(!sys.is_cloexec(ACTIVATION_FD));
        assert!(sys.written(ACTIVATION_FD).is_empty());
        assert_eq!(sys.written(new_fd).len(), ignite_proto::RECORD_LEN);
    }

    #[test]
    fn low_descriptors_are_raised_above_floor() {
        let mut sys = FakeSys::new();
        for fd in 0..3 {
            sys.close(fd).unwrap();
        }
        let (read, status) = sys.pipe().unwrap();
        assert_eq!((read, status), (0, 1));
        let control = sys.alloc_fd();
        let req = LaunchRequest::builder(["svc"])
            .status_pipe(status)
            .control_socket(control)
            .build()
            .unwrap();
        sys.fail_next(Op::Execvp, Errno::ENOENT);
        run_child(&mut sys, req).unwrap_err();

        let raised: Vec<_> = sys
            .calls()
            .iter()
            .filter_map(|c| match c {
                Call::DupMin { fd, min, cloexec, new_fd } => Some((*fd, *min, *cloexec, *new_fd)),
                _ => None,
            })
            .collect();
        assert_eq!(raised.len(), 2);
        assert!(raised.iter().all(|&(_, min, _, new_fd)| min == 3 && new_fd >= 3));
        assert_eq!(raised[0].0, status);
        assert!(raised[0].2);
        assert!(!raised[1].2);
        assert_eq!(
            sys.env("IGNITE_CS_FD"),
            Some(raised[1].3.to_string().as_str())
        );
        assert_eq!(sys.written(raised[0].3).len(), ignite_proto::RECORD_LEN);
    }

    #[test]
    fn notify_on_stdout_keeps_stdout() {
        let mut sys = FakeSys::new();
        let (_read, status) = sys.pipe().unwrap();
        let notify = sys.alloc_fd();
        let req = LaunchRequest::builder(["svc"])
            .status_pipe(status)
            .notify_fd(notify)
            .pinned_notify_fd(1)
            .log_target("/var/log/svc.log")
            .build()
            .unwrap();
        run_child(&mut sys, req).unwrap();

        assert!(sys.calls().contains(&Call::Dup2(notify, 1)));
        assert!(!sys.calls().contains(&Call::Close(1)));
        assert!(!sys.calls().contains(&Call::Dup2(1, 2)));
        assert!(sys.calls().iter().any(|c| matches!(c, Call::Open(p, _) if p == "/var/log/svc.log")));
        assert_eq!(sys.open_fds(), vec![0, 1, 2]);
    }

    #[test]
    fn vacated_std_slot_is_not_closed_twice() {
        let mut sys = FakeSys::new();
        let (_read, status) = sys.pipe().unwrap();
        // Notification descriptor sits on stdin and is pinned elsewhere.
        let req = LaunchRequest::builder(["svc"])
            .status_pipe(status)
            .notify_fd(0)
            .pinned_notify_fd(9)
            .build()
            .unwrap();
        run_child(&mut sys, req).unwrap();
        assert_eq!(sys.calls().iter().filter(|c| **c == Call::Close(0)).count(), 1);
        assert!(sys.is_open(9));
        assert_eq!(sys.open_fds(), vec![0, 1, 2, 9]);
    }

    #[test]
    fn env_file_failure_is_attributed() {
        let (mut sys, status, req) = setup(|b| b.env_file("/etc/missing.env"));
        run_child(&mut sys, req).unwrap_err();
        assert_eq!(
            report(&sys, status),
            StatusReport::Failed(LaunchFailure::new(
                LaunchStage::ReadEnvFile,
                Errno::ENOENT as i32
            ))
        );
    }

    /// Runs `req` to a reported failure and returns it.
    fn reported(sys: &mut FakeSys, status: RawFd, req: LaunchRequest) -> LaunchFailure {
        let failure = run_child(sys, req).unwrap_err();
        assert_eq!(report(sys, status), StatusReport::Failed(failure));
        assert_eq!(sys.exit_status(), Some(0));
        failure
    }

    #[test]
    fn arrange_failure_is_attributed() {
        let mut sys = FakeSys::new();
        let (_read, status) = sys.pipe().unwrap();
        let notify = sys.alloc_fd();
        let req = LaunchRequest::builder(["svc"])
            .status_pipe(status)
            .notify_fd(notify)
            .pinned_notify_fd(status)
            .build()
            .unwrap();
        sys.fail_next(Op::DupMin, Errno::EMFILE);
        assert_eq!(
            reported(&mut sys, status, req),
            LaunchFailure::new(LaunchStage::ArrangeFds, Errno::EMFILE as i32)
        );
    }

    #[test]
    fn notify_var_failure_is_attributed() {
        let (mut sys, status, req) = setup(|b| b.notify_fd(2).notify_var("NOTIFY_FD"));
        sys.fail_next(Op::Putenv, Errno::ENOMEM);
        assert_eq!(
            reported(&mut sys, status, req),
            LaunchFailure::new(LaunchStage::SetNotifyFdVar, Errno::ENOMEM as i32)
        );
    }

    #[test]
    fn activation_failure_is_attributed() {
        let (mut sys, status, req) = setup(|b| b.activation_socket(0));
        sys.fail_next(Op::Putenv, Errno::ENOMEM);
        assert_eq!(
            reported(&mut sys, status, req),
            LaunchFailure::new(LaunchStage::SetupActivationSocket, Errno::ENOMEM as i32)
        );
    }

    #[test]
    fn control_socket_failure_is_attributed() {
        let (mut sys, status, req) = setup(|b| b.control_socket(2));
        sys.fail_next(Op::Putenv, Errno::E2BIG);
        assert_eq!(
            reported(&mut sys, status, req),
            LaunchFailure::new(LaunchStage::SetupControlSocket, Errno::E2BIG as i32)
        );
    }

    #[test]
    fn stdio_failure_is_attributed() {
        let (mut sys, status, req) = setup(|b| b);
        sys.fail_next(Op::Open, Errno::EACCES);
        assert_eq!(
            reported(&mut sys, status, req),
            LaunchFailure::new(LaunchStage::SetupStdio, Errno::EACCES as i32)
        );
    }

    #[test]
    fn rlimit_failure_is_attributed() {
        let (mut sys, status, req) =
            setup(|b| b.rlimit(ResourceLimit::both(Resource::RLIMIT_CORE, 0, 0)));
        sys.fail_next(Op::Setrlimit, Errno::EPERM);
        assert_eq!(
            reported(&mut sys, status, req),
            LaunchFailure::new(LaunchStage::SetRlimits, Errno::EPERM as i32)
        );
    }

    #[test]
    fn hard_only_limits_keep_soft() {
        let nofile = Resource::RLIMIT_NOFILE;
        let (mut sys, _status, req) = setup(|b| {
            b.rlimit(ResourceLimit::parse(nofile, ":8192").unwrap())
                .rlimit(ResourceLimit::parse(nofile, ":16384").unwrap())
        });
        run_child(&mut sys, req).unwrap();
        assert_eq!(sys.rlimit(nofile), Rlimit { soft: 1024, hard: 16384 });
    }

    #[test]
    fn limits_precede_identity_and_group_precedes_user() {
        let (mut sys, _status, req) = setup(|b| {
            b.rlimit(ResourceLimit::both(Resource::RLIMIT_CORE, 0, 0))
                .uid(Uid::from_raw(1000))
                .gid(Gid::from_raw(100))
        });
        run_child(&mut sys, req).unwrap();

        let limit = sys.position(|c| matches!(c, Call::Setrlimit(..))).unwrap();
        let group = sys.position(|c| matches!(c, Call::Setregid(_))).unwrap();
        let user = sys.position(|c| matches!(c, Call::Setreuid(_))).unwrap();
        assert!(limit < group && group < user);
        assert_eq!(sys.identity(), (Uid::from_raw(1000), Gid::from_raw(100)));
    }

    #[test]
    fn identity_failure_is_attributed() {
        let (mut sys, status, req) = setup(|b| b.uid(Uid::from_raw(1000)));
        sys.fail_next(Op::Setreuid, Errno::EPERM);
        run_child(&mut sys, req).unwrap_err();
        assert_eq!(
            report(&sys, status),
            StatusReport::Failed(LaunchFailure::new(LaunchStage::SetUidGid, Errno::EPERM as i32))
        );
    }

    #[test]
    fn signal_mask_is_restored_minus_delivered_signals() {
        let (mut sys, _status, req) = setup(|b| b);
        let mut original = SigSet::empty();
        original.add(Signal::SIGTERM);
        original.add(Signal::SIGUSR1);
        sys.sigprocmask(SigmaskHow::SIG_SETMASK, &original).unwrap();

        run_child(&mut sys, req).unwrap();
        assert!(sys.sigmask().contains(Signal::SIGUSR1));
        assert!(!sys.sigmask().contains(Signal::SIGTERM));
        let restore = sys.calls().iter().rposition(|c| *c == Call::SetSigmask).unwrap();
        let exec = sys.position(|c| matches!(c, Call::Execvp(_))).unwrap();
        assert!(restore < exec);
    }

    #[test]
    fn console_claims_terminal_when_unowned() {
        let (mut sys, _status, req) = setup(|b| b.on_console(true).in_foreground(true));
        sys.set_terminal_session(None);
        run_child(&mut sys, req).unwrap();

        assert!(sys.calls().contains(&Call::IgnoreSignal(Signal::SIGTSTP)));
        assert!(sys.calls().contains(&Call::Setsid));
        assert!(sys.calls().contains(&Call::SetControllingTerminal(0)));
        assert_eq!(sys.foreground(), Some(Pid::from_raw(100)));
        // Standard streams untouched.
        assert!(!sys.calls().iter().any(|c| matches!(c, Call::Open(..))));
    }

    #[test]
    fn console_joins_existing_session() {
        let (mut sys, _status, req) = setup(|b| b.on_console(true));
        run_child(&mut sys, req).unwrap();

        assert!(!sys.calls().contains(&Call::Setsid));
        assert!(
            sys.calls()
                .contains(&Call::Setpgid(Pid::from_raw(0), Pid::from_raw(0)))
        );
        assert_eq!(sys.foreground(), None);
        assert_eq!(sys.session(), (Pid::from_raw(50), Pid::from_raw(100)));
    }
}
