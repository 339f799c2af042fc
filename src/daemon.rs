//! Detaching the server into the background.
//!
//! The parent re-executes its own binary without the daemon flags, with stdio
//! pointed at `/dev/null` and in a new session, then exits. The child is
//! an ordinary server process: it claims the PID file and answers remote stop
//! like any other.

use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

/// Flags that request daemonization and must not reach the child.
const DAEMON_FLAGS: &[&str] = &["-d", "--daemon", "--restart"];

/// Drop every daemon flag from `args` (program name excluded).
pub fn strip_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .filter(|arg| !DAEMON_FLAGS.iter().any(|flag| arg.as_os_str() == *flag))
        .collect()
}

/// Command that runs `program` with null stdio as the leader of a new
/// session, with no controlling terminal.
pub fn detached_command(program: &Path, args: &[OsString]) -> Command {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: setsid(2) is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()?;
            Ok(())
        });
    }
    command
}

/// Spawn the detached child and return its PID.
pub fn daemonize() -> io::Result<u32> {
    let exe = std::env::current_exe()?;
    let args = strip_flags(std::env::args_os().skip(1));

    let child = detached_command(&exe, &args).spawn()?;
    tracing::info!(pid = child.id(), exe = %exe.display(), "Daemon started");
    Ok(child.id())
}
