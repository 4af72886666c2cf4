//! Thin safe wrappers over the libc calls the job runner depends on.
//! Everything here returns `io::Result` built from `errno` so callers can
//! propagate failures with `?`.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Installs the SIGINT handler. `SA_RESTART` is deliberately left off so a
/// pending interrupt unwinds blocking `waitpid` calls.
pub fn install_interrupt_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigint as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
    }
}

/// Consumes a pending interrupt, if any.
pub fn take_interrupt() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(last_os_error());
    }
    Ok((fds[0], fds[1]))
}

pub fn dup2(source: RawFd, dest: RawFd) -> io::Result<()> {
    if unsafe { libc::dup2(source, dest) } < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

pub fn read(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    let count = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
    if count < 0 {
        return Err(last_os_error());
    }
    Ok(count as usize)
}

/// Waits up to `timeout_ms` for `fd` to become readable.
pub fn poll_read(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if result < 0 {
        return Err(last_os_error());
    }
    Ok(result > 0 && pollfd.revents & (libc::POLLIN | libc::POLLHUP) != 0)
}

pub fn fork() -> io::Result<libc::pid_t> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(last_os_error());
    }
    Ok(pid)
}

pub fn setpgid(pid: libc::pid_t, pgid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::setpgid(pid, pgid) } < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Replaces the current process image. Only ever returns on failure.
pub fn execvp(argv: &[String]) -> io::Error {
    let Ok(c_strings) = argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()
    else {
        return io::Error::new(io::ErrorKind::InvalidInput, "argument contains a NUL byte");
    };

    let mut c_argv: Vec<*const libc::c_char> =
        c_strings.iter().map(|arg| arg.as_ptr()).collect();
    c_argv.push(std::ptr::null());

    unsafe {
        libc::execvp(c_argv[0], c_argv.as_ptr());
    }
    last_os_error()
}

pub struct WaitStatus {
    pub pid: libc::pid_t,
    pub status: libc::c_int,
}

impl WaitStatus {
    pub fn exit_code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.status) {
            Some(libc::WEXITSTATUS(self.status))
        } else if libc::WIFSIGNALED(self.status) {
            Some(128 + libc::WTERMSIG(self.status))
        } else {
            None
        }
    }

    pub fn stopped(&self) -> bool {
        libc::WIFSTOPPED(self.status)
    }
}

/// Waits for the given pid (or any child when `pid` is -1). Returns `None`
/// when `WNOHANG` was requested and no child had anything to report, or when
/// there are no children at all.
pub fn waitpid(pid: libc::pid_t, flags: libc::c_int) -> io::Result<Option<WaitStatus>> {
    let mut status = 0;
    let result = unsafe { libc::waitpid(pid, &mut status, flags) };
    if result < 0 {
        let error = last_os_error();
        if error.raw_os_error() == Some(libc::ECHILD) {
            return Ok(None);
        }
        return Err(error);
    }
    if result == 0 {
        return Ok(None);
    }
    Ok(Some(WaitStatus {
        pid: result,
        status,
    }))
}

pub fn kill(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

pub fn killpg(pgid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::killpg(pgid, signal) } < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

pub fn getpid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

pub fn current_uid() -> libc::uid_t {
    unsafe { libc::getuid() }
}

pub fn isatty(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

pub fn tcgetattr(fd: RawFd) -> io::Result<libc::termios> {
    let mut termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut termios) } < 0 {
        return Err(last_os_error());
    }
    Ok(termios)
}

pub fn tcsetattr(fd: RawFd, termios: &libc::termios) -> io::Result<()> {
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, termios) } < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

pub fn umask(mask: libc::mode_t) -> libc::mode_t {
    unsafe { libc::umask(mask) }
}

pub fn hostname() -> String {
    let mut buffer = [0 as libc::c_char; 256];
    if unsafe { libc::gethostname(buffer.as_mut_ptr(), buffer.len()) } < 0 {
        return "localhost".to_string();
    }
    unsafe { CStr::from_ptr(buffer.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn passwd_field(entry: *const libc::passwd, field: impl Fn(&libc::passwd) -> *const libc::c_char) -> Option<String> {
    if entry.is_null() {
        return None;
    }
    let pointer = field(unsafe { &*entry });
    if pointer.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(pointer) }.to_string_lossy().into_owned())
}

pub fn home_directory_for_uid(uid: libc::uid_t) -> Option<String> {
    let entry = unsafe { libc::getpwuid(uid) };
    passwd_field(entry, |pw| pw.pw_dir)
}

pub fn home_directory_for_user(name: &str) -> Option<String> {
    let name = CString::new(name).ok()?;
    let entry = unsafe { libc::getpwnam(name.as_ptr()) };
    passwd_field(entry, |pw| pw.pw_dir)
}

pub fn username_for_uid(uid: libc::uid_t) -> Option<String> {
    let entry = unsafe { libc::getpwuid(uid) };
    passwd_field(entry, |pw| pw.pw_name)
}
