use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ast::{Node, NodeKind};
use crate::builtins;
use crate::command::Command;
use crate::errors::{Result, ShellError};
use crate::exec::job::JobRef;
use crate::exec::{runner, sys};
use crate::expand;
use crate::parser;
use crate::value::Value;

use super::options::Options;

/// Bytes read from a capture pipe per readiness event.
const CAPTURE_CHUNK: usize = 4096;

struct Capture {
    fd: RawFd,
    buffer: Vec<u8>,
}

/// The mutable process-wide shell state: variable and alias tables, the job
/// table, the working directory, and the cached program-name index, plus
/// the read-eval entry points that drive everything else.
pub struct Session {
    pub local_variables: HashMap<String, Value>,
    pub aliases: HashMap<String, String>,
    pub jobs: BTreeMap<u64, JobRef>,
    pub cwd: PathBuf,
    pub home: PathBuf,
    pub username: String,
    pub hostname: String,
    pub uid: u32,
    pub pid: i32,
    pub last_return_code: i32,
    /// Sorted, deduplicated names reachable through $PATH plus builtins and
    /// aliases; the completion engine binary-searches it.
    pub cached_path: Vec<String>,
    pub directory_stack: Vec<PathBuf>,
    pub cd_history: Vec<PathBuf>,
    pub options: Options,
    pub history: Vec<String>,
    pub interactive: bool,
    pub default_termios: Option<libc::termios>,
    saved_termios: Option<libc::termios>,
    captures: Vec<Capture>,
}

impl Session {
    pub fn new() -> Result<Self> {
        let uid = sys::current_uid();
        let pid = sys::getpid();
        let home = env::var("HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| sys::home_directory_for_uid(uid).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/"));
        let username = env::var("USER")
            .ok()
            .or_else(|| sys::username_for_uid(uid))
            .unwrap_or_else(|| "nobody".to_string());
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        env::set_var("PWD", &cwd);

        let default_termios = if sys::isatty(0) {
            sys::tcgetattr(0).ok()
        } else {
            None
        };

        let mut session = Self {
            local_variables: HashMap::new(),
            aliases: HashMap::new(),
            jobs: BTreeMap::new(),
            directory_stack: vec![cwd.clone()],
            cd_history: Vec::new(),
            cwd,
            home,
            username,
            hostname: sys::hostname(),
            uid,
            pid,
            last_return_code: 0,
            cached_path: Vec::new(),
            options: Options::default(),
            history: Vec::new(),
            interactive: false,
            default_termios,
            saved_termios: None,
            captures: Vec::new(),
        };
        session.cache_path();
        Ok(session)
    }

    // ---- variables and aliases ----

    pub fn lookup_local_variable(&self, name: &str) -> Option<&Value> {
        self.local_variables.get(name)
    }

    /// The variable's words joined with spaces, or the replacement when it
    /// is unset.
    pub fn local_variable_or(&self, name: &str, replacement: &str) -> String {
        match self.lookup_local_variable(name) {
            Some(value) => value.resolve_as_list(self).join(" "),
            None => replacement.to_string(),
        }
    }

    pub fn set_local_variable(&mut self, name: &str, value: Value) {
        self.local_variables.insert(name.to_string(), value);
    }

    pub fn unset_local_variable(&mut self, name: &str) -> bool {
        self.local_variables.remove(name).is_some()
    }

    pub fn resolve_alias(&self, name: &str) -> Option<String> {
        self.aliases.get(name).cloned()
    }

    pub fn set_alias(&mut self, name: &str, body: &str) {
        self.aliases.insert(name.to_string(), body.to_string());
        self.cache_path();
    }

    pub fn remove_alias(&mut self, name: &str) -> bool {
        let removed = self.aliases.remove(name).is_some();
        if removed {
            self.cache_path();
        }
        removed
    }

    // ---- paths ----

    pub fn cwd_string(&self) -> String {
        self.cwd.to_string_lossy().into_owned()
    }

    /// Absolute, canonicalized form of a possibly relative path. Falls back
    /// to plain joining when the path does not exist.
    pub fn resolve_path(&self, path: &str) -> String {
        let absolute = if path.starts_with('/') {
            PathBuf::from(path)
        } else {
            self.cwd.join(path)
        };
        fs::canonicalize(&absolute)
            .unwrap_or(absolute)
            .to_string_lossy()
            .into_owned()
    }

    /// Changes the working directory, recording the old one in the cd
    /// history and keeping $PWD in sync.
    pub fn set_cwd(&mut self, new_directory: &Path) -> std::io::Result<()> {
        let canonical = fs::canonicalize(new_directory)?;
        env::set_current_dir(&canonical)?;
        env::set_var("PWD", &canonical);
        self.cd_history.push(self.cwd.clone());
        self.cwd = canonical;
        Ok(())
    }

    /// Rebuilds the sorted program-name cache: builtins, aliases, then
    /// every executable reachable through $PATH.
    pub fn cache_path(&mut self) {
        self.cached_path.clear();

        for name in builtins::builtin_names() {
            self.cached_path.push(expand::escape_token(name));
        }
        for alias in self.aliases.keys() {
            self.cached_path.push(expand::escape_token(alias));
        }

        if let Ok(path) = env::var("PATH") {
            for directory in path.split(':').filter(|directory| !directory.is_empty()) {
                let Ok(entries) = fs_err::read_dir(directory) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let file_name = entry.file_name();
                    let Some(name) = file_name.to_str() else {
                        continue;
                    };
                    let Ok(metadata) = entry.metadata() else {
                        continue;
                    };
                    // 0o111 is the executable bit for user, group and other.
                    if metadata.is_dir() || metadata.permissions().mode() & 0o111 == 0 {
                        continue;
                    }
                    self.cached_path.push(expand::escape_token(name));
                }
            }
        }

        self.cached_path.sort();
        self.cached_path.dedup();
    }

    // ---- the read-eval entry points ----

    /// Parses and evaluates one command line, reporting syntax errors with
    /// a ten-byte context window. Returns the resulting return code.
    pub fn run_command(&mut self, text: &str) -> i32 {
        if text.trim().is_empty() {
            return self.last_return_code;
        }
        let Some(ast) = parser::parse(text) else {
            return self.last_return_code;
        };

        if let Some(error) = ast.syntax_error() {
            eprintln!("conch: Syntax error in command: {}", error.message);
            let start = error.position.start.min(text.len());
            let window = (error.position.end.saturating_sub(error.position.start)).min(10);
            let end = (start + window).min(text.len());
            let context = text.get(start..end).unwrap_or("");
            eprintln!("Around '{context}'");
            self.last_return_code = 1;
            return 1;
        }

        self.save_termios();
        let result = ast.run(self);
        if let Value::Job(Some(job)) = result {
            if let Some(code) = job.borrow().exit_code {
                self.last_return_code = code;
            }
        }
        self.last_return_code
    }

    pub fn run_file(&mut self, path: &str) -> Result<i32> {
        let contents =
            fs_err::read_to_string(path).map_err(|source| ShellError::ScriptUnreadable {
                path: path.to_string(),
                source,
            })?;
        Ok(self.run_command(&contents))
    }

    /// Runs an evaluated command list. Foreground commands are blocked on
    /// here; pipe sources join the returned wait set; everything else is
    /// marked as running in the background.
    pub fn run_commands(&mut self, commands: &[Command]) -> Vec<JobRef> {
        let mut jobs_to_wait_for = Vec::new();

        for command in commands {
            match runner::run_command(self, command) {
                Ok(Some(job)) => {
                    if command.should_wait {
                        self.block_on_job(&job);
                        if !job.borrow().suspended {
                            jobs_to_wait_for.push(job);
                        }
                    } else if command.is_pipe_source {
                        jobs_to_wait_for.push(job);
                    } else if command.should_notify_if_in_background {
                        job.borrow_mut().running_in_background = true;
                        self.restore_stdin();
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    // The offending command is skipped; the rest of the
                    // list still runs.
                    eprintln!("conch: {error}");
                    self.last_return_code = 1;
                }
            }
        }

        jobs_to_wait_for
    }

    /// Drives the cooperative wait loop until the job exits or stops.
    /// While a capture pipe is active the loop polls it instead of parking
    /// in `waitpid`, so substitution output is drained as it appears.
    pub fn block_on_job(&mut self, job: &JobRef) {
        loop {
            {
                let state = job.borrow();
                if state.exited() || state.suspended {
                    break;
                }
            }

            if sys::take_interrupt() {
                let _ = sys::killpg(job.borrow().pgid, libc::SIGINT);
            }

            if self.captures.is_empty() {
                let pid = job.borrow().pid;
                match sys::waitpid(pid, libc::WUNTRACED) {
                    Ok(Some(status)) => self.record_wait_status(status),
                    Ok(None) => break,
                    Err(error) if error.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(_) => break,
                }
            } else {
                self.drain_captures(100);
                self.reap_jobs();
            }
        }
        self.restore_stdin();
    }

    /// Reaps every child that has something to report, without blocking.
    pub fn reap_jobs(&mut self) {
        while let Ok(Some(status)) = sys::waitpid(-1, libc::WNOHANG | libc::WUNTRACED) {
            self.record_wait_status(status);
        }
    }

    fn record_wait_status(&mut self, status: sys::WaitStatus) {
        let Some(job) = self
            .jobs
            .values()
            .find(|job| job.borrow().pid == status.pid)
            .cloned()
        else {
            return;
        };

        if status.stopped() {
            job.borrow_mut().suspended = true;
            return;
        }
        if let Some(code) = status.exit_code() {
            job.borrow_mut().set_exited(code);
            self.notify_job_exit(&job);
        }
    }

    /// The on-exit notification: background jobs are announced, and the job
    /// leaves the table either way.
    fn notify_job_exit(&mut self, job: &JobRef) {
        let (job_id, in_background, cmd) = {
            let state = job.borrow();
            (state.job_id, state.running_in_background, state.cmd.clone())
        };
        if in_background && self.interactive {
            eprintln!("conch: Job {job_id}({cmd}) exited");
        }
        self.jobs.remove(&job_id);
    }

    // ---- jobs ----

    pub fn register_job(&mut self, job: JobRef) {
        let job_id = job.borrow().job_id;
        self.jobs.insert(job_id, job);
    }

    pub fn find_last_job_id(&self) -> u64 {
        self.jobs.keys().max().copied().unwrap_or(0)
    }

    /// Accepts `%N`, a plain job id, or nothing (the most recent job).
    pub fn find_job(&self, spec: Option<&str>) -> Result<JobRef> {
        let job = match spec {
            None => self.jobs.values().last().cloned(),
            Some(spec) => {
                let id_text = spec.strip_prefix('%').unwrap_or(spec);
                id_text
                    .parse::<u64>()
                    .ok()
                    .and_then(|id| self.jobs.get(&id).cloned())
            }
        };
        job.ok_or_else(|| ShellError::UnknownJob(spec.unwrap_or("%").to_string()))
    }

    pub fn kill_job(&self, job: &JobRef, signal: i32) {
        let _ = sys::killpg(job.borrow().pgid, signal);
    }

    /// Teardown: every remaining job gets SIGCONT then SIGHUP, and after a
    /// short grace window anything still alive is killed.
    pub fn stop_all_jobs(&mut self) {
        if self.jobs.is_empty() {
            return;
        }
        if self.interactive {
            println!("Killing active jobs");
        }
        for job in self.jobs.values() {
            let state = job.borrow();
            if !state.running_in_background {
                let _ = sys::killpg(state.pgid, libc::SIGCONT);
            }
            let _ = sys::killpg(state.pgid, libc::SIGHUP);
        }

        std::thread::sleep(Duration::from_millis(10));

        for job in self.jobs.values() {
            // ESRCH here just means the process already left by itself.
            let _ = sys::killpg(job.borrow().pgid, libc::SIGKILL);
        }
        self.jobs.clear();
    }

    // ---- terminal attributes ----

    pub fn save_termios(&mut self) {
        if sys::isatty(0) {
            self.saved_termios = sys::tcgetattr(0).ok();
        }
    }

    pub fn restore_stdin(&self) {
        if let Some(termios) = &self.saved_termios {
            let _ = sys::tcsetattr(0, termios);
        }
    }

    // ---- capture pipes for command substitution ----

    pub fn begin_capture(&mut self, fd: RawFd) {
        let _ = sys::set_nonblocking(fd);
        self.captures.push(Capture {
            fd,
            buffer: Vec::new(),
        });
    }

    fn drain_captures(&mut self, timeout_ms: i32) {
        if let Some(capture) = self.captures.last() {
            let _ = sys::poll_read(capture.fd, timeout_ms);
        }
        for capture in &mut self.captures {
            let mut chunk = [0u8; CAPTURE_CHUNK];
            if let Ok(count) = sys::read(capture.fd, &mut chunk) {
                capture.buffer.extend_from_slice(&chunk[..count]);
            }
        }
    }

    /// Drains whatever is left in the innermost capture pipe and closes it.
    pub fn finish_capture(&mut self) -> String {
        let Some(mut capture) = self.captures.pop() else {
            return String::new();
        };
        loop {
            let mut chunk = [0u8; CAPTURE_CHUNK];
            match sys::read(capture.fd, &mut chunk) {
                Ok(0) => break,
                Ok(count) => capture.buffer.extend_from_slice(&chunk[..count]),
                Err(error) if error.raw_os_error() == Some(libc::EINTR) => continue,
                Err(_) => break,
            }
        }
        sys::close(capture.fd);
        String::from_utf8_lossy(&capture.buffer).into_owned()
    }

    // ---- alias expansion ----

    /// Resolves aliases at the head of each command. The alias body is
    /// parsed with the shell's own parser and joined with the remaining
    /// argv; an alias whose expansion starts with its own name is not
    /// expanded again.
    pub fn expand_aliases(&mut self, initial_commands: Vec<Command>) -> Vec<Command> {
        let mut commands = Vec::new();
        for command in initial_commands {
            self.resolve_aliases_into(command, &mut commands);
        }
        commands
    }

    fn resolve_aliases_into(&mut self, command: Command, out: &mut Vec<Command>) {
        let Some(alias_name) = command.argv.first().cloned() else {
            out.push(command);
            return;
        };
        let Some(alias_body) = self.resolve_alias(&alias_name) else {
            out.push(command);
            return;
        };
        let Some(mut subtree) = parser::parse(&alias_body) else {
            out.push(command);
            return;
        };

        while matches!(subtree.kind, NodeKind::Execute { .. }) {
            let NodeKind::Execute { command: inner, .. } = subtree.kind else {
                unreachable!();
            };
            subtree = *inner;
        }

        let mut remainder = command;
        remainder.argv.remove(0);
        let position = subtree.position;
        let substitute = Node::new(
            NodeKind::Join {
                left: Box::new(subtree),
                right: Box::new(Node::new(
                    NodeKind::CommandLiteral { command: remainder },
                    position,
                )),
            },
            position,
        );

        for substituted in substitute.run(self).resolve_as_commands(self) {
            if substituted.argv.first() == Some(&alias_name) {
                out.push(substituted);
            } else {
                self.resolve_aliases_into(substituted, out);
            }
        }
    }

    // ---- history ----

    pub fn history_path(&self) -> PathBuf {
        self.home.join(".history")
    }

    pub fn add_history_entry(&mut self, line: &str) {
        self.history.push(line.to_string());
    }

    pub fn load_history(&mut self) {
        let Ok(contents) = fs_err::read_to_string(self.history_path()) else {
            return;
        };
        self.history
            .extend(contents.lines().map(str::to_string));
    }

    /// One line per entry, mode 0600.
    pub fn save_history(&self) {
        let path = self.history_path();
        let Ok(mut file) = fs_err::File::create(&path) else {
            return;
        };
        for line in &self.history {
            let _ = writeln!(file, "{line}");
        }
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cached_path_is_sorted_and_unique() {
        let session = Session::new().unwrap();
        let mut sorted = session.cached_path.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(session.cached_path, sorted);
        assert!(!session.cached_path.is_empty());
    }

    #[test]
    fn local_variables_round_trip() {
        let mut session = Session::new().unwrap();
        session.set_local_variable("greeting", Value::string("hello"));
        assert_eq!(session.local_variable_or("greeting", "fallback"), "hello");
        assert!(session.unset_local_variable("greeting"));
        assert_eq!(session.local_variable_or("greeting", "fallback"), "fallback");
    }

    #[test]
    fn aliases_join_the_program_cache() {
        let mut session = Session::new().unwrap();
        session.set_alias("zzz-quite-unique", "echo sleepy");
        assert!(session
            .cached_path
            .binary_search(&"zzz-quite-unique".to_string())
            .is_ok());
        session.remove_alias("zzz-quite-unique");
        assert!(session
            .cached_path
            .binary_search(&"zzz-quite-unique".to_string())
            .is_err());
    }

    #[test]
    fn self_referential_alias_expansion_terminates() {
        let mut session = Session::new().unwrap();
        session.set_alias("ls", "ls --color");
        let commands =
            session.expand_aliases(vec![Command::from_argv(vec!["ls".into(), "/".into()])]);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].argv, vec!["ls", "--color", "/"]);
    }

    #[test]
    fn alias_expansion_merges_redirections() {
        let mut session = Session::new().unwrap();
        session.set_alias("ll", "ls -l");
        let commands =
            session.expand_aliases(vec![Command::from_argv(vec!["ll".into(), "/tmp".into()])]);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].argv, vec!["ls", "-l", "/tmp"]);
    }

    #[test]
    fn unknown_job_lookup_fails() {
        let session = Session::new().unwrap();
        assert!(session.find_job(Some("%42")).is_err());
    }

    #[test]
    fn syntax_errors_set_return_code_one() {
        let mut session = Session::new().unwrap();
        assert_eq!(session.run_command("echo 'unterminated"), 1);
        assert_eq!(session.last_return_code, 1);
    }

    #[test]
    fn empty_line_leaves_the_return_code_alone() {
        let mut session = Session::new().unwrap();
        session.last_return_code = 7;
        assert_eq!(session.run_command("   "), 7);
        assert_eq!(session.last_return_code, 7);
    }
}
