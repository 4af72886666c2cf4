use std::cell::Cell;
use std::fs::OpenOptions;
use std::os::unix::io::IntoRawFd;
use std::rc::Rc;

use crate::errors::{Result, ShellError};

/// A file descriptor slot shared between the two ends of a pipe.
///
/// `Fd2Fd` and pipe redirections are cloned around freely while a command
/// list is being assembled; sharing the destination through an `Rc<Cell<_>>`
/// lets the job runner fill in the real fd (the freshly created pipe end)
/// once, and have every clone observe it.
pub type FdSlot = Rc<Cell<i32>>;

pub fn fd_slot(fd: i32) -> FdSlot {
    Rc::new(Cell::new(fd))
}

/// What the job runner should do with the fds involved in a rewiring once it
/// has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewiringAction {
    None,
    /// The source fd is a transient owned by the parent; collect it.
    Source,
    /// The destination fd is a transient owned by the parent; collect it.
    Destination,
    /// Create a fresh pipe here; the linked rewiring receives the read end.
    RefreshDestination,
    /// Do not rewire anything, just close the destination fd.
    ImmediatelyCloseDestination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectionDirection {
    Read,
    Write,
    WriteAppend,
    ReadWrite,
}

/// An fd-to-fd rewiring request attached to a command, e.g. one half of a
/// pipe or an explicit `N>&M`.
#[derive(Debug, Clone)]
pub struct FdRedirection {
    pub source_fd: i32,
    pub dest: FdSlot,
    pub action: RewiringAction,
    /// For `RefreshDestination`: the partner slot that receives the pipe's
    /// read end.
    pub other_end: Option<FdSlot>,
}

/// A declarative instruction to reshape a child's fd table at fork time.
/// The child performs `dup2(dest, source)` for each rewiring.
#[derive(Debug, Clone)]
pub struct Rewiring {
    pub source_fd: i32,
    pub dest: FdSlot,
    pub action: RewiringAction,
    pub other_end: Option<FdSlot>,
}

#[derive(Debug, Clone)]
pub enum Redirection {
    Path {
        path: String,
        fd: i32,
        direction: RedirectionDirection,
    },
    Fd(FdRedirection),
    Close {
        fd: i32,
    },
}

impl Redirection {
    /// Resolves the redirection into a rewiring, opening any file it names.
    /// A failed `open()` aborts the whole command; no partial rewiring leaks
    /// into a started process.
    pub fn apply(&self) -> Result<Rewiring> {
        match self {
            Redirection::Path {
                path,
                fd,
                direction,
            } => {
                let mut options = OpenOptions::new();
                match direction {
                    RedirectionDirection::Read => options.read(true),
                    RedirectionDirection::Write => options.write(true).create(true).truncate(true),
                    RedirectionDirection::WriteAppend => options.append(true).create(true),
                    RedirectionDirection::ReadWrite => options.read(true).write(true).create(true),
                };
                let file = options.open(path).map_err(|source| ShellError::Redirection {
                    path: path.clone(),
                    source,
                })?;
                Ok(Rewiring {
                    source_fd: *fd,
                    dest: fd_slot(file.into_raw_fd()),
                    action: RewiringAction::Destination,
                    other_end: None,
                })
            }
            Redirection::Fd(redirection) => Ok(Rewiring {
                source_fd: redirection.source_fd,
                dest: redirection.dest.clone(),
                action: redirection.action,
                other_end: redirection.other_end.clone(),
            }),
            Redirection::Close { fd } => Ok(Rewiring {
                source_fd: *fd,
                dest: fd_slot(*fd),
                action: RewiringAction::ImmediatelyCloseDestination,
                other_end: None,
            }),
        }
    }
}

/// Plain record carrying an argument vector, its ordered redirections and
/// the scheduling flags the job runner consults.
#[derive(Debug, Clone)]
pub struct Command {
    pub argv: Vec<String>,
    pub redirections: Vec<Redirection>,
    pub should_wait: bool,
    pub is_pipe_source: bool,
    pub should_notify_if_in_background: bool,
}

impl Default for Command {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            redirections: Vec::new(),
            should_wait: true,
            is_pipe_source: false,
            should_notify_if_in_background: true,
        }
    }
}

impl Command {
    pub fn from_argv(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    pub fn from_redirection(redirection: Redirection) -> Self {
        Self {
            redirections: vec![redirection],
            ..Default::default()
        }
    }
}

/// Concatenates two command lists into one by merging the last command of
/// `left` with the first command of `right`: their argvs and redirections
/// are appended, and the scheduling flags combined.
pub fn join_commands(mut left: Vec<Command>, mut right: Vec<Command>) -> Vec<Command> {
    let last_in_left = left.pop().unwrap_or_default();
    let first_in_right = if right.is_empty() {
        Command::default()
    } else {
        right.remove(0)
    };

    let mut command = Command::default();
    command.argv.extend(last_in_left.argv);
    command.argv.extend(first_in_right.argv);
    command.redirections.extend(last_in_left.redirections);
    command.redirections.extend(first_in_right.redirections);
    command.should_wait = first_in_right.should_wait && last_in_left.should_wait;
    command.is_pipe_source = first_in_right.is_pipe_source;
    command.should_notify_if_in_background =
        first_in_right.should_wait && last_in_left.should_notify_if_in_background;

    let mut commands = left;
    commands.push(command);
    commands.extend(right);
    commands
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn join_merges_argv_and_redirections() {
        let left = vec![Command::from_argv(vec!["echo".into(), "hi".into()])];
        let right = vec![Command::from_redirection(Redirection::Close { fd: 2 })];

        let joined = join_commands(left, right);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].argv, vec!["echo".to_string(), "hi".to_string()]);
        assert_eq!(joined[0].redirections.len(), 1);
        assert!(joined[0].should_wait);
    }

    #[test]
    fn join_keeps_surrounding_commands() {
        let left = vec![
            Command::from_argv(vec!["a".into()]),
            Command::from_argv(vec!["b".into()]),
        ];
        let right = vec![
            Command::from_argv(vec!["c".into()]),
            Command::from_argv(vec!["d".into()]),
        ];

        let joined = join_commands(left, right);
        assert_eq!(joined.len(), 3);
        assert_eq!(joined[1].argv, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn join_inherits_pipe_source_from_the_right() {
        let mut pipe_source = Command::from_argv(vec!["head".into()]);
        pipe_source.is_pipe_source = true;
        pipe_source.should_wait = false;

        let joined = join_commands(vec![Command::from_argv(vec!["tail".into()])], vec![pipe_source]);
        assert!(joined[0].is_pipe_source);
        assert!(!joined[0].should_wait);
    }

    #[test]
    fn close_redirection_is_marked_immediate() {
        let rewiring = Redirection::Close { fd: 3 }.apply().unwrap();
        assert_eq!(rewiring.action, RewiringAction::ImmediatelyCloseDestination);
        assert_eq!(rewiring.source_fd, 3);
    }

    #[test]
    fn path_redirection_on_missing_file_fails() {
        let redirection = Redirection::Path {
            path: "/definitely/not/a/real/path".into(),
            fd: 0,
            direction: RedirectionDirection::Read,
        };
        assert!(redirection.apply().is_err());
    }
}
