use std::fs;
use std::io::Read;

use crate::builtins;
use crate::command::{Command, RewiringAction};
use crate::errors::{Result, ShellError};
use crate::expand;
use crate::state::session::Session;

use super::fds::FdCollector;
use super::job::{Job, JobRef};
use super::sys;

/// Lowers one evaluated command into a running OS process.
///
/// Returns `Ok(None)` when no job was created: the command was a builtin,
/// had an empty argv (its rewirings are applied to the shell process
/// itself), or could not be launched.
pub fn run_command(session: &mut Session, command: &Command) -> Result<Option<JobRef>> {
    if session.options.verbose {
        let echoed: Vec<String> = command
            .argv
            .iter()
            .map(|arg| expand::escape_token(arg))
            .collect();
        eprintln!("+ {}", echoed.join(" "));
    }

    // Resolve redirections. The collector owns every transient fd from here
    // on; any early return closes them all.
    let mut fds = FdCollector::new();
    let mut rewirings = Vec::new();
    for redirection in &command.redirections {
        let rewiring = redirection.apply()?;

        match rewiring.action {
            RewiringAction::ImmediatelyCloseDestination => {
                fds.add(rewiring.dest.get());
            }
            RewiringAction::Source => {
                fds.add(rewiring.source_fd);
                rewirings.push(rewiring);
            }
            RewiringAction::Destination => {
                if rewiring.dest.get() != -1 {
                    fds.add(rewiring.dest.get());
                }
                rewirings.push(rewiring);
            }
            RewiringAction::RefreshDestination => {
                let Some(other_end) = rewiring.other_end.clone() else {
                    eprintln!("conch: dangling pipe rewiring, skipping");
                    continue;
                };
                let (read_fd, write_fd) = sys::pipe().map_err(ShellError::PipeFailed)?;
                rewiring.dest.set(write_fd);
                // The read end joins the collection when the linked command
                // resolves its own redirections.
                other_end.set(read_fd);
                fds.add(write_fd);
                rewirings.push(rewiring);
            }
            RewiringAction::None => rewirings.push(rewiring),
        }
    }

    // An empty command rewires the shell process itself.
    if command.argv.is_empty() {
        for rewiring in &rewirings {
            sys::dup2(rewiring.dest.get(), rewiring.source_fd)
                .map_err(ShellError::RewiringFailed)?;
        }
        fds.collect();
        return Ok(None);
    }

    if let Some(code) = builtins::run_builtin(session, &command.argv) {
        session.last_return_code = code;
        return Ok(None);
    }

    let child = sys::fork().map_err(ShellError::ForkFailed)?;
    if child == 0 {
        let _ = sys::setpgid(0, 0);
        if let Some(termios) = session.default_termios {
            let _ = sys::tcsetattr(0, &termios);
        }
        for rewiring in &rewirings {
            if let Err(error) = sys::dup2(rewiring.dest.get(), rewiring.source_fd) {
                eprintln!("conch: dup2: {error}");
                unsafe { libc::_exit(126) };
            }
        }
        fds.collect();

        let error = sys::execvp(&command.argv);
        report_exec_error(&command.argv[0], error);
    }

    let job = Job::spawn(
        child,
        child,
        command.argv.join(" "),
        session.find_last_job_id() + 1,
    );
    session.register_job(job.clone());
    fds.collect();

    Ok(Some(job))
}

/// Child-side diagnostics for a failed `execvp`. Never returns.
fn report_exec_error(argv0: &str, error: std::io::Error) -> ! {
    let code = if error.raw_os_error() == Some(libc::ENOENT) {
        match shebang_interpreter(argv0) {
            Some(interpreter) => {
                eprintln!(
                    "conch: {argv0}: Invalid interpreter \"{interpreter}\": No such file or directory"
                );
                126
            }
            None => {
                eprintln!("conch: {argv0}: Command not found.");
                127
            }
        }
    } else if fs::metadata(argv0).map(|m| m.is_dir()).unwrap_or(false) {
        eprintln!("conch: {argv0}: Is a directory");
        126
    } else {
        eprintln!("execvp({argv0}): {error}");
        126
    };
    unsafe { libc::_exit(code) }
}

/// Reads the target's first 256 bytes; a `#!` opener yields the interpreter
/// spec up to the first newline.
fn shebang_interpreter(path: &str) -> Option<String> {
    let mut head = [0u8; 256];
    let mut file = fs::File::open(path).ok()?;
    let bytes_read = file.read(&mut head).ok()?;
    let head = &head[..bytes_read];
    if !head.starts_with(b"#!") {
        return None;
    }
    let spec = &head[2..];
    let end = spec
        .iter()
        .position(|&byte| byte == b'\n' || byte == b'\r')
        .unwrap_or(spec.len());
    Some(String::from_utf8_lossy(&spec[..end]).into_owned())
}
