//! Builtin commands. Builtins run inside the shell process, which is what
//! lets them mutate session state (variables, aliases, the working
//! directory, the job table) that a child process could never touch. Each
//! returns an exit code instead of producing a job.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::command::Command;
use crate::errors::{Result, ShellError};
use crate::exec::{runner, sys};
use crate::state::options::Options;
use crate::state::session::Session;

type Builtin = fn(&mut Session, &[String]) -> Result<i32>;

#[rustfmt::skip]
const BUILTINS: &[(&str, Builtin)] = &[
    ("alias",   define_alias),
    ("bg",      background),
    ("cd",      change_directory),
    ("cdh",     directory_history),
    ("dirs",    list_directory_stack),
    ("disown",  disown_job),
    ("exit",    exit_shell),
    ("export",  export_variable),
    ("fg",      foreground),
    ("history", show_history),
    ("jobs",    list_jobs),
    ("kill",    kill_process),
    ("popd",    pop_directory),
    ("pushd",   push_directory),
    ("pwd",     working_directory),
    ("setopt",  set_option),
    ("source",  source_file),
    ("time",    time_command),
    ("umask",   file_creation_mask),
    ("unalias", remove_alias),
    ("unset",   unset_variable),
    ("wait",    wait_for_jobs),
];

pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|(name, _)| *name)
}

pub fn has_builtin(name: &str) -> bool {
    BUILTINS.iter().any(|(builtin, _)| *builtin == name)
}

/// Dispatches argv to a builtin if one matches. Returns the exit code, or
/// `None` when argv[0] names no builtin.
pub fn run_builtin(session: &mut Session, argv: &[String]) -> Option<i32> {
    let name = argv.first()?;
    let (_, function) = BUILTINS.iter().find(|(builtin, _)| builtin == name)?;
    Some(match function(session, argv) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("conch: {name}: {error}");
            1
        }
    })
}

fn builtin_err(message: impl Into<String>) -> ShellError {
    ShellError::Builtin(message.into())
}

fn change_directory(session: &mut Session, argv: &[String]) -> Result<i32> {
    let target = match argv.get(1).map(String::as_str) {
        None => session.home.clone(),
        Some("-") => session
            .cd_history
            .last()
            .cloned()
            .ok_or_else(|| builtin_err("no previous directory"))?,
        Some(path) => PathBuf::from(path),
    };
    session
        .set_cwd(&target)
        .map_err(|error| builtin_err(format!("{}: {error}", target.display())))?;
    Ok(0)
}

fn directory_history(session: &mut Session, argv: &[String]) -> Result<i32> {
    match argv.get(1) {
        None => {
            if session.cd_history.is_empty() {
                println!("cdh: no history");
                return Ok(1);
            }
            for (index, directory) in session.cd_history.iter().enumerate() {
                println!("{:5}  {}", index + 1, directory.display());
            }
            Ok(0)
        }
        Some(index_text) => {
            let index: usize = index_text
                .parse()
                .map_err(|_| builtin_err(format!("invalid history index '{index_text}'")))?;
            let target = session
                .cd_history
                .get(index.wrapping_sub(1))
                .cloned()
                .ok_or_else(|| builtin_err(format!("no history entry {index}")))?;
            session
                .set_cwd(&target)
                .map_err(|error| builtin_err(format!("{}: {error}", target.display())))?;
            Ok(0)
        }
    }
}

fn push_directory(session: &mut Session, argv: &[String]) -> Result<i32> {
    match argv.get(1) {
        Some(path) => {
            let previous = session.cwd.clone();
            session
                .set_cwd(Path::new(path))
                .map_err(|error| builtin_err(format!("{path}: {error}")))?;
            session.directory_stack.push(previous);
        }
        None => {
            // Swap the working directory with the top of the stack.
            if session.directory_stack.len() < 2 {
                return Err(builtin_err("no other directory"));
            }
            let top = session.directory_stack.pop().unwrap();
            let previous = session.cwd.clone();
            session
                .set_cwd(&top)
                .map_err(|error| builtin_err(format!("{}: {error}", top.display())))?;
            session.directory_stack.push(previous);
        }
    }
    Ok(0)
}

fn pop_directory(session: &mut Session, _argv: &[String]) -> Result<i32> {
    if session.directory_stack.len() <= 1 {
        return Err(builtin_err("directory stack empty"));
    }
    let target = session.directory_stack.pop().unwrap();
    session
        .set_cwd(&target)
        .map_err(|error| builtin_err(format!("{}: {error}", target.display())))?;
    Ok(0)
}

fn list_directory_stack(session: &mut Session, _argv: &[String]) -> Result<i32> {
    let mut entries = vec![session.cwd_string()];
    entries.extend(
        session
            .directory_stack
            .iter()
            .rev()
            .map(|directory| directory.to_string_lossy().into_owned()),
    );
    println!("{}", entries.join(" "));
    Ok(0)
}

fn exit_shell(session: &mut Session, argv: &[String]) -> Result<i32> {
    let code = match argv.get(1) {
        Some(code_text) => code_text
            .parse()
            .map_err(|_| builtin_err(format!("invalid exit code '{code_text}'")))?,
        None => session.last_return_code,
    };
    session.stop_all_jobs();
    if session.interactive {
        session.save_history();
    }
    std::process::exit(code);
}

fn export_variable(session: &mut Session, argv: &[String]) -> Result<i32> {
    if argv.len() == 1 {
        let mut variables: Vec<(String, String)> = env::vars().collect();
        variables.sort();
        for (name, value) in variables {
            println!("{name}={value}");
        }
        return Ok(0);
    }

    let mut touched_path = false;
    for argument in &argv[1..] {
        let (name, value) = match argument.split_once('=') {
            Some((name, value)) => (name, value.to_string()),
            // Promote a local variable into the environment.
            None => match session.lookup_local_variable(argument) {
                Some(value) => (
                    argument.as_str(),
                    value.resolve_as_list(session).join(" "),
                ),
                None => continue,
            },
        };
        env::set_var(name, value);
        touched_path |= name == "PATH";
    }
    if touched_path {
        session.cache_path();
    }
    Ok(0)
}

fn unset_variable(session: &mut Session, argv: &[String]) -> Result<i32> {
    for name in &argv[1..] {
        if !session.unset_local_variable(name) {
            env::remove_var(name);
        }
    }
    Ok(0)
}

fn define_alias(session: &mut Session, argv: &[String]) -> Result<i32> {
    if argv.len() == 1 {
        let mut aliases: Vec<_> = session.aliases.iter().collect();
        aliases.sort();
        for (name, body) in aliases {
            println!("alias {name}='{body}'");
        }
        return Ok(0);
    }

    let mut code = 0;
    for argument in &argv[1..] {
        match argument.split_once('=') {
            Some((name, body)) => session.set_alias(name, body),
            None => match session.resolve_alias(argument) {
                Some(body) => println!("alias {argument}='{body}'"),
                None => {
                    eprintln!("conch: alias: {argument}: not found");
                    code = 1;
                }
            },
        }
    }
    Ok(code)
}

fn remove_alias(session: &mut Session, argv: &[String]) -> Result<i32> {
    let mut code = 0;
    for name in &argv[1..] {
        if !session.remove_alias(name) {
            eprintln!("conch: unalias: {name}: not found");
            code = 1;
        }
    }
    Ok(code)
}

fn show_history(session: &mut Session, _argv: &[String]) -> Result<i32> {
    for (index, line) in session.history.iter().enumerate() {
        println!("{:5}  {line}", index + 1);
    }
    Ok(0)
}

fn list_jobs(session: &mut Session, _argv: &[String]) -> Result<i32> {
    for job in session.jobs.values() {
        let job = job.borrow();
        println!(
            "[{}] {} {} {}",
            job.job_id,
            job.pid,
            job.state_name(),
            job.cmd
        );
    }
    Ok(0)
}

fn foreground(session: &mut Session, argv: &[String]) -> Result<i32> {
    let job = session.find_job(argv.get(1).map(String::as_str))?;
    {
        let mut state = job.borrow_mut();
        state.running_in_background = false;
        state.suspended = false;
    }
    println!("{}", job.borrow().cmd);
    session.kill_job(&job, libc::SIGCONT);
    session.block_on_job(&job);
    let exit_code = job.borrow().exit_code.unwrap_or(0);
    Ok(exit_code)
}

fn background(session: &mut Session, argv: &[String]) -> Result<i32> {
    let job = session.find_job(argv.get(1).map(String::as_str))?;
    {
        let mut state = job.borrow_mut();
        state.running_in_background = true;
        state.suspended = false;
    }
    println!("[{}] {} &", job.borrow().job_id, job.borrow().cmd);
    session.kill_job(&job, libc::SIGCONT);
    Ok(0)
}

fn disown_job(session: &mut Session, argv: &[String]) -> Result<i32> {
    let job = session.find_job(argv.get(1).map(String::as_str))?;
    let job_id = job.borrow().job_id;
    session.jobs.remove(&job_id);
    Ok(0)
}

fn kill_process(session: &mut Session, argv: &[String]) -> Result<i32> {
    let mut arguments = argv[1..].iter().peekable();
    let mut signal = libc::SIGTERM;
    if let Some(first) = arguments.peek() {
        if let Some(spec) = first.strip_prefix('-') {
            signal = parse_signal(spec)?;
            arguments.next();
        }
    }

    let targets: Vec<&String> = arguments.collect();
    if targets.is_empty() {
        return Err(builtin_err("usage: kill [-SIGNAL] <pid|%job>..."));
    }

    let mut code = 0;
    for target in targets {
        if target.starts_with('%') {
            match session.find_job(Some(target)) {
                Ok(job) => session.kill_job(&job, signal),
                Err(error) => {
                    eprintln!("conch: kill: {error}");
                    code = 1;
                }
            }
        } else {
            let pid: i32 = target
                .parse()
                .map_err(|_| builtin_err(format!("invalid pid '{target}'")))?;
            if let Err(error) = sys::kill(pid, signal) {
                eprintln!("conch: kill: {pid}: {error}");
                code = 1;
            }
        }
    }
    Ok(code)
}

fn parse_signal(spec: &str) -> Result<i32> {
    if let Ok(number) = spec.parse() {
        return Ok(number);
    }
    let name = spec.strip_prefix("SIG").unwrap_or(spec);
    let signal = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        _ => return Err(builtin_err(format!("unknown signal '{spec}'"))),
    };
    Ok(signal)
}

fn set_option(session: &mut Session, argv: &[String]) -> Result<i32> {
    if argv.len() == 1 {
        for name in Options::NAMES {
            let state = if session.options.get(name) == Some(true) {
                "on"
            } else {
                "off"
            };
            println!("{name:<35} {state}");
        }
        return Ok(0);
    }

    for argument in &argv[1..] {
        let mut name = argument.strip_prefix("--").unwrap_or(argument);
        let mut value = true;
        if let Some(negated) = name.strip_prefix("no_") {
            name = negated;
            value = false;
        }
        if !session.options.set(name, value) {
            return Err(ShellError::UnknownOption(name.to_string()));
        }
    }
    Ok(0)
}

/// Runs the rest of argv as a command and reports wall-clock time.
fn time_command(session: &mut Session, argv: &[String]) -> Result<i32> {
    if argv.len() == 1 {
        return Ok(0);
    }
    let command = Command::from_argv(argv[1..].to_vec());
    let started = Instant::now();
    let code = if let Some(job) = runner::run_command(session, &command)? {
        session.block_on_job(&job);
        job.borrow().exit_code.unwrap_or(session.last_return_code)
    } else {
        session.last_return_code
    };
    eprintln!("Time: {} ms", started.elapsed().as_millis());
    Ok(code)
}

fn file_creation_mask(_session: &mut Session, argv: &[String]) -> Result<i32> {
    match argv.get(1) {
        None => {
            let current = sys::umask(0);
            sys::umask(current);
            println!("{current:04o}");
        }
        Some(mask_text) => {
            let mask = u32::from_str_radix(mask_text, 8)
                .map_err(|_| builtin_err(format!("invalid mask '{mask_text}'")))?;
            sys::umask(mask as libc::mode_t);
        }
    }
    Ok(0)
}

fn source_file(session: &mut Session, argv: &[String]) -> Result<i32> {
    let path = argv
        .get(1)
        .ok_or_else(|| builtin_err("usage: source <file>"))?;
    session.run_file(path)
}

fn working_directory(session: &mut Session, _argv: &[String]) -> Result<i32> {
    println!("{}", session.cwd_string());
    Ok(0)
}

fn wait_for_jobs(session: &mut Session, _argv: &[String]) -> Result<i32> {
    let jobs: Vec<_> = session.jobs.values().cloned().collect();
    for job in jobs {
        session.block_on_job(&job);
    }
    Ok(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn the_builtin_set_is_complete() {
        for name in [
            "cd", "cdh", "pushd", "popd", "dirs", "exit", "export", "unset", "alias", "unalias",
            "history", "jobs", "fg", "bg", "disown", "kill", "setopt", "time", "umask", "source",
            "pwd", "wait",
        ] {
            assert!(has_builtin(name), "missing builtin {name}");
        }
        assert!(!has_builtin("definitely-not-a-builtin"));
    }

    #[test]
    fn setopt_toggles_options() {
        let mut session = Session::new().unwrap();
        let argv: Vec<String> = ["setopt", "--verbose"].iter().map(|s| s.to_string()).collect();
        assert_eq!(run_builtin(&mut session, &argv), Some(0));
        assert!(session.options.verbose);

        let argv: Vec<String> = ["setopt", "--no_verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(run_builtin(&mut session, &argv), Some(0));
        assert!(!session.options.verbose);
    }

    #[test]
    fn setopt_rejects_unknown_names() {
        let mut session = Session::new().unwrap();
        let argv: Vec<String> = ["setopt", "--no_such_option"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(run_builtin(&mut session, &argv), Some(1));
    }

    #[test]
    fn alias_and_unalias_round_trip() {
        let mut session = Session::new().unwrap();
        let argv: Vec<String> = ["alias", "ll=ls -l"].iter().map(|s| s.to_string()).collect();
        assert_eq!(run_builtin(&mut session, &argv), Some(0));
        assert_eq!(session.resolve_alias("ll").as_deref(), Some("ls -l"));

        let argv: Vec<String> = ["unalias", "ll"].iter().map(|s| s.to_string()).collect();
        assert_eq!(run_builtin(&mut session, &argv), Some(0));
        assert!(session.resolve_alias("ll").is_none());
    }

    // Directory changes are process-global, so every cwd-touching case
    // lives in this one test to keep the suite parallel-safe.
    #[test]
    fn directory_builtins_change_and_restore() {
        let scratch = tempfile::tempdir().unwrap();
        let scratch_path = scratch.path().to_string_lossy().into_owned();
        let mut session = Session::new().unwrap();
        let original = session.cwd.clone();

        let argv = vec!["cd".to_string(), scratch_path.clone()];
        assert_eq!(run_builtin(&mut session, &argv), Some(0));
        assert_eq!(session.cwd, std::fs::canonicalize(scratch.path()).unwrap());

        let argv = vec!["cd".to_string(), "-".to_string()];
        assert_eq!(run_builtin(&mut session, &argv), Some(0));
        assert_eq!(session.cwd, original);

        let argv = vec!["pushd".to_string(), scratch_path];
        assert_eq!(run_builtin(&mut session, &argv), Some(0));
        assert_ne!(session.cwd, original);

        let argv = vec!["popd".to_string()];
        assert_eq!(run_builtin(&mut session, &argv), Some(0));
        assert_eq!(session.cwd, original);
    }

    #[test]
    fn unknown_signal_names_are_rejected() {
        assert!(parse_signal("TERM").is_ok());
        assert!(parse_signal("SIGKILL").is_ok());
        assert!(parse_signal("9").is_ok());
        assert!(parse_signal("NOPE").is_err());
    }
}
