//! Low-level command execution on posix using posix_spawn.
//!
//! Commands run under `/bin/sh -c` with stdout and stderr merged into a
//! single pipe so output interleaves the way it would on a terminal.
//! Console commands skip the pipe and inherit the controlling terminal.
//! We avoid std::process because merging the two streams into one pipe and
//! handing the raw fd to a streaming reader is not expressible there.

use std::fs::File;
use std::os::fd::FromRawFd;
use std::os::unix::process::ExitStatusExt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// For calls that return -1 and set errno.
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret < 0 {
        anyhow::bail!("{}: {}", func, std::io::Error::last_os_error());
    }
    Ok(())
}

/// For the posix_spawn family, which returns the error code directly.
fn check_spawn(func: &str, err: libc::c_int) -> anyhow::Result<()> {
    if err != 0 {
        anyhow::bail!("{}: {}", func, std::io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Wraps libc::posix_spawn_file_actions_t, in particular to implement Drop.
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_spawn(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_spawn(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_spawn(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

extern "C" {
    static environ: *const *mut libc::c_char;
}

/// Spawn `cmdline`.  Returns the child's pid, and the read end of its merged
/// stdout/stderr pipe unless `use_console` left the terminal attached.
pub fn spawn(cmdline: &str, use_console: bool) -> anyhow::Result<(libc::pid_t, Option<File>)> {
    unsafe {
        let mut actions = PosixSpawnFileActions::new()?;

        let mut pipe: [libc::c_int; 2] = [0; 2];
        if !use_console {
            check_posix("pipe", libc::pipe(pipe.as_mut_ptr()))?;
            // stdout/stderr => pipe; both ends closed in the child.
            actions.adddup2(pipe[1], 1)?;
            actions.adddup2(pipe[1], 2)?;
            actions.addclose(pipe[0])?;
            actions.addclose(pipe[1])?;
        }

        let shell = b"/bin/sh\0".as_ptr() as *const libc::c_char;
        let dash_c = b"-c\0".as_ptr() as *const libc::c_char;
        let cmdline_nul = std::ffi::CString::new(cmdline)?;
        let argv: [*const libc::c_char; 4] =
            [shell, dash_c, cmdline_nul.as_ptr(), std::ptr::null()];

        let mut pid: libc::pid_t = 0;
        check_spawn(
            "posix_spawn",
            libc::posix_spawn(
                &mut pid,
                shell,
                actions.as_ptr(),
                std::ptr::null(),
                argv.as_ptr() as *const *mut libc::c_char,
                environ,
            ),
        )?;

        if use_console {
            Ok((pid, None))
        } else {
            check_posix("close", libc::close(pipe[1]))?;
            Ok((pid, Some(File::from_raw_fd(pipe[0]))))
        }
    }
}

/// Reap the child.  The returned note, if non-empty, describes an abnormal
/// exit and belongs at the end of the command's captured output.
pub fn wait(pid: libc::pid_t) -> anyhow::Result<(Termination, Vec<u8>)> {
    let status = unsafe {
        let mut status: libc::c_int = 0;
        check_posix("waitpid", libc::waitpid(pid, &mut status, 0))?;
        std::process::ExitStatus::from_raw(status)
    };

    let mut note = Vec::new();
    let mut termination = Termination::Success;
    if !status.success() {
        termination = Termination::Failure;
        if let Some(sig) = status.signal() {
            match sig {
                libc::SIGINT => {
                    note.extend_from_slice(b"interrupted");
                    termination = Termination::Interrupted;
                }
                _ => note.extend_from_slice(format!("signal {}", sig).as_bytes()),
            }
        }
    }
    Ok((termination, note))
}

pub fn interrupt(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGINT);
    }
}
