use std::fmt::Write as _;

use crate::command::{
    fd_slot, join_commands, Command, FdRedirection, Redirection, RedirectionDirection,
    RewiringAction,
};
use crate::exec::sys;
use crate::state::session::Session;
use crate::value::Value;

/// A half-open byte span carried by every AST node. `contains` accepts the
/// end offset as well so that hit-testing the cursor at the end of a token
/// still matches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub start: usize,
    pub end: usize,
}

impl Position {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset <= self.end
    }
}

/// The deepest syntax error beneath a node, cloned into every ancestor so
/// that broken trees stay traversable while still reporting precisely.
#[derive(Debug, Clone)]
pub struct SyntaxErrorInfo {
    pub position: Position,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub name: Node,
    pub value: Node,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    And { left: Box<Node>, right: Box<Node> },
    Background { command: Box<Node> },
    BarewordLiteral { text: String },
    CastToCommand { inner: Box<Node> },
    CastToList { inner: Option<Box<Node>> },
    CloseFdRedirection { fd: i32 },
    CommandLiteral { command: Command },
    Comment { text: String },
    DoubleQuotedString { inner: Box<Node> },
    DynamicEvaluate { inner: Box<Node> },
    Execute { command: Box<Node>, capture_stdout: bool },
    Fd2FdRedirection { source_fd: i32, dest_fd: i32 },
    Glob { text: String },
    Join { left: Box<Node>, right: Box<Node> },
    Juxtaposition { left: Box<Node>, right: Box<Node> },
    ListConcatenate { element: Box<Node>, list: Box<Node> },
    Or { left: Box<Node>, right: Box<Node> },
    Pipe { left: Box<Node>, right: Box<Node> },
    ReadRedirection { fd: i32, path: Box<Node> },
    ReadWriteRedirection { fd: i32, path: Box<Node> },
    Sequence { left: Box<Node>, right: Box<Node> },
    SimpleVariable { name: String },
    SpecialVariable { name: char },
    StringLiteral { text: String },
    StringPartCompose { left: Box<Node>, right: Box<Node> },
    SyntaxError { message: String },
    Tilde { username: String },
    VariableDeclarations { variables: Vec<VariableDecl> },
    WriteAppendRedirection { fd: i32, path: Box<Node> },
    WriteRedirection { fd: i32, path: Box<Node> },
}

/// Result of locating the node covering a byte offset, together with the
/// nearest enclosing command and the nearest node that carries semantic
/// meaning of its own (used to pick the completion strategy).
#[derive(Debug, Default, Clone, Copy)]
pub struct HitTestResult<'a> {
    pub matching_node: Option<&'a Node>,
    pub closest_node_with_semantic_meaning: Option<&'a Node>,
    pub closest_command_node: Option<&'a Node>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub position: Position,
    syntax_error: Option<SyntaxErrorInfo>,
}

impl Node {
    pub fn new(kind: NodeKind, position: Position) -> Self {
        let syntax_error = match &kind {
            NodeKind::SyntaxError { message } => Some(SyntaxErrorInfo {
                position,
                message: message.clone(),
            }),
            _ => child_nodes(&kind)
                .into_iter()
                .find_map(|child| child.syntax_error.clone()),
        };
        Self {
            kind,
            position,
            syntax_error,
        }
    }

    pub fn is_syntax_error(&self) -> bool {
        self.syntax_error.is_some()
    }

    pub fn syntax_error(&self) -> Option<&SyntaxErrorInfo> {
        self.syntax_error.as_ref()
    }

    pub fn is_bareword(&self) -> bool {
        matches!(self.kind, NodeKind::BarewordLiteral { .. })
    }

    pub fn is_tilde(&self) -> bool {
        matches!(self.kind, NodeKind::Tilde { .. })
    }

    pub fn is_execute(&self) -> bool {
        matches!(self.kind, NodeKind::Execute { .. })
    }

    pub fn is_command(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::CastToCommand { .. } | NodeKind::CommandLiteral { .. } | NodeKind::Join { .. }
        )
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::ListConcatenate { .. } | NodeKind::CastToList { .. }
        )
    }

    pub fn is_redirection(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::ReadRedirection { .. }
                | NodeKind::WriteRedirection { .. }
                | NodeKind::WriteAppendRedirection { .. }
                | NodeKind::ReadWriteRedirection { .. }
                | NodeKind::CloseFdRedirection { .. }
                | NodeKind::Fd2FdRedirection { .. }
        )
    }

    /// Whether running this subtree creates processes by itself, as opposed
    /// to evaluating into a command list for an enclosing `Execute`.
    pub fn would_execute(&self) -> bool {
        match &self.kind {
            NodeKind::Execute { .. } | NodeKind::And { .. } | NodeKind::Or { .. } => true,
            NodeKind::Sequence { left, right } => left.would_execute() || right.would_execute(),
            NodeKind::Background { command } => command.would_execute(),
            _ => false,
        }
    }

    pub fn class_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::And { .. } => "And",
            NodeKind::Background { .. } => "Background",
            NodeKind::BarewordLiteral { .. } => "BarewordLiteral",
            NodeKind::CastToCommand { .. } => "CastToCommand",
            NodeKind::CastToList { .. } => "CastToList",
            NodeKind::CloseFdRedirection { .. } => "CloseFdRedirection",
            NodeKind::CommandLiteral { .. } => "CommandLiteral",
            NodeKind::Comment { .. } => "Comment",
            NodeKind::DoubleQuotedString { .. } => "DoubleQuotedString",
            NodeKind::DynamicEvaluate { .. } => "DynamicEvaluate",
            NodeKind::Execute { .. } => "Execute",
            NodeKind::Fd2FdRedirection { .. } => "Fd2FdRedirection",
            NodeKind::Glob { .. } => "Glob",
            NodeKind::Join { .. } => "Join",
            NodeKind::Juxtaposition { .. } => "Juxtaposition",
            NodeKind::ListConcatenate { .. } => "ListConcatenate",
            NodeKind::Or { .. } => "Or",
            NodeKind::Pipe { .. } => "Pipe",
            NodeKind::ReadRedirection { .. } => "ReadRedirection",
            NodeKind::ReadWriteRedirection { .. } => "ReadWriteRedirection",
            NodeKind::Sequence { .. } => "Sequence",
            NodeKind::SimpleVariable { .. } => "SimpleVariable",
            NodeKind::SpecialVariable { .. } => "SpecialVariable",
            NodeKind::StringLiteral { .. } => "StringLiteral",
            NodeKind::StringPartCompose { .. } => "StringPartCompose",
            NodeKind::SyntaxError { .. } => "SyntaxError",
            NodeKind::Tilde { .. } => "Tilde",
            NodeKind::VariableDeclarations { .. } => "VariableDeclarations",
            NodeKind::WriteAppendRedirection { .. } => "WriteAppendRedirection",
            NodeKind::WriteRedirection { .. } => "WriteRedirection",
        }
    }

    /// Debug rendering of the tree, one node per line, indented by depth.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, level: usize) {
        let _ = writeln!(
            out,
            "{:indent$}{} at {}:{}",
            "",
            self.class_name(),
            self.position.start,
            self.position.end,
            indent = level * 2
        );
        let detail = match &self.kind {
            NodeKind::BarewordLiteral { text }
            | NodeKind::StringLiteral { text }
            | NodeKind::Glob { text }
            | NodeKind::Comment { text } => Some(text.clone()),
            NodeKind::SimpleVariable { name } => Some(name.clone()),
            NodeKind::SpecialVariable { name } => Some(name.to_string()),
            NodeKind::Tilde { username } => Some(format!("~{username}")),
            NodeKind::SyntaxError { message } => Some(message.clone()),
            NodeKind::CloseFdRedirection { fd } => Some(format!("{fd} -> Close")),
            NodeKind::Fd2FdRedirection { source_fd, dest_fd } => {
                Some(format!("{source_fd} -> {dest_fd}"))
            }
            NodeKind::CommandLiteral { .. } => Some("(generated command literal)".to_string()),
            NodeKind::Execute { capture_stdout, .. } if *capture_stdout => {
                Some("(capturing stdout)".to_string())
            }
            _ => None,
        };
        if let Some(detail) = detail {
            let _ = writeln!(out, "{:indent$}{}", "", detail, indent = (level + 1) * 2);
        }
        for child in child_nodes(&self.kind) {
            child.dump_into(out, level + 1);
        }
    }

    /// The first plain literal in command position, i.e. the program name.
    pub fn leftmost_trivial_literal(&self) -> Option<&Node> {
        match &self.kind {
            NodeKind::BarewordLiteral { .. } | NodeKind::StringLiteral { .. } => Some(self),
            NodeKind::ListConcatenate { element, .. } => element.leftmost_trivial_literal(),
            NodeKind::CastToCommand { inner } => inner.leftmost_trivial_literal(),
            NodeKind::CastToList { inner } => {
                inner.as_ref().and_then(|inner| inner.leftmost_trivial_literal())
            }
            NodeKind::Execute { command, .. } => command.leftmost_trivial_literal(),
            NodeKind::Join { left, right } => left
                .leftmost_trivial_literal()
                .or_else(|| right.leftmost_trivial_literal()),
            NodeKind::Juxtaposition { left, .. } => left.leftmost_trivial_literal(),
            _ => None,
        }
    }

    pub fn hit_test(&self, offset: usize) -> HitTestResult<'_> {
        if !self.position.contains(offset) {
            return HitTestResult::default();
        }

        match &self.kind {
            NodeKind::And { left, right } | NodeKind::Or { left, right } => {
                let mut result = left.hit_test(offset);
                if result.matching_node.is_none() {
                    result = right.hit_test(offset);
                }
                if result.closest_command_node.is_none() {
                    result.closest_command_node = Some(right);
                }
                result
            }
            NodeKind::Background { command } => command.hit_test(offset),
            NodeKind::CastToCommand { inner } => {
                let mut result = inner.hit_test(offset);
                if result.closest_node_with_semantic_meaning.is_none() {
                    result.closest_node_with_semantic_meaning = Some(self);
                }
                if result.closest_command_node.is_none() {
                    result.closest_command_node = Some(self);
                }
                result
            }
            NodeKind::CastToList { inner } => inner
                .as_ref()
                .map(|inner| inner.hit_test(offset))
                .unwrap_or_default(),
            NodeKind::DoubleQuotedString { inner } | NodeKind::DynamicEvaluate { inner } => {
                inner.hit_test(offset)
            }
            NodeKind::Execute { command, .. } => {
                let mut result = command.hit_test(offset);
                if result.closest_node_with_semantic_meaning.is_none() {
                    result.closest_node_with_semantic_meaning = Some(self);
                }
                if result.closest_command_node.is_none() {
                    result.closest_command_node = Some(command);
                }
                result
            }
            NodeKind::Join { left, right } => {
                let result = left.hit_test(offset);
                if result.matching_node.is_some() {
                    return result;
                }
                right.hit_test(offset)
            }
            NodeKind::Juxtaposition { left, right } => {
                let mut result = left.hit_test(offset);
                if result.matching_node.is_none() {
                    result = right.hit_test(offset);
                }
                if result.closest_node_with_semantic_meaning.is_none() {
                    result.closest_node_with_semantic_meaning = Some(self);
                }
                result
            }
            NodeKind::ListConcatenate { element, list } => {
                let result = element.hit_test(offset);
                if result.matching_node.is_some() {
                    return result;
                }
                let mut result = list.hit_test(offset);
                if result.closest_node_with_semantic_meaning.is_none() {
                    result.closest_node_with_semantic_meaning = Some(self);
                }
                result
            }
            NodeKind::Pipe { left, right }
            | NodeKind::Sequence { left, right }
            | NodeKind::StringPartCompose { left, right } => {
                let result = left.hit_test(offset);
                if result.matching_node.is_some() {
                    return result;
                }
                right.hit_test(offset)
            }
            NodeKind::ReadRedirection { path, .. }
            | NodeKind::WriteRedirection { path, .. }
            | NodeKind::WriteAppendRedirection { path, .. }
            | NodeKind::ReadWriteRedirection { path, .. } => {
                let mut result = path.hit_test(offset);
                if result.closest_node_with_semantic_meaning.is_none() {
                    result.closest_node_with_semantic_meaning = Some(self);
                }
                result
            }
            NodeKind::VariableDeclarations { variables } => {
                for decl in variables {
                    let result = decl.value.hit_test(offset);
                    if result.matching_node.is_some() {
                        return result;
                    }
                }
                HitTestResult::default()
            }
            NodeKind::SimpleVariable { .. }
            | NodeKind::SpecialVariable { .. }
            | NodeKind::Tilde { .. } => HitTestResult {
                matching_node: Some(self),
                closest_node_with_semantic_meaning: Some(self),
                closest_command_node: None,
            },
            _ => HitTestResult {
                matching_node: Some(self),
                closest_node_with_semantic_meaning: None,
                closest_command_node: None,
            },
        }
    }

    /// Evaluates the node. Only `Execute` nodes (and subtrees forwarded by
    /// them) may create processes.
    pub fn run(&self, session: &mut Session) -> Value {
        match &self.kind {
            NodeKind::BarewordLiteral { text } | NodeKind::StringLiteral { text } => {
                Value::string(text.clone())
            }
            NodeKind::Glob { text } => Value::Glob(text.clone()),
            NodeKind::Tilde { username } => Value::Tilde(username.clone()),
            NodeKind::SimpleVariable { name } => Value::SimpleVariable(name.clone()),
            NodeKind::SpecialVariable { name } => Value::SpecialVariable(*name),
            NodeKind::CommandLiteral { command } => Value::Command(command.clone()),
            NodeKind::Comment { .. } => Value::empty_list(),
            NodeKind::SyntaxError { .. } => Value::string(""),

            NodeKind::And { left, right } => {
                let left_value = left.run(session);
                let Value::Job(job) = &left_value else {
                    return left_value;
                };
                match job.clone() {
                    Some(job) => {
                        session.block_on_job(&job);
                        if job.borrow().exit_code == Some(0) {
                            right.run(session)
                        } else {
                            left_value
                        }
                    }
                    // The left side never became a job (builtin, empty
                    // command, failed launch); branch on its return code.
                    None => {
                        if session.last_return_code == 0 {
                            right.run(session)
                        } else {
                            left_value
                        }
                    }
                }
            }

            NodeKind::Or { left, right } => {
                let left_value = left.run(session);
                let Value::Job(job) = &left_value else {
                    return left_value;
                };
                match job.clone() {
                    Some(job) => {
                        session.block_on_job(&job);
                        if job.borrow().exit_code == Some(0) {
                            left_value
                        } else {
                            right.run(session)
                        }
                    }
                    None => {
                        if session.last_return_code == 0 {
                            left_value
                        } else {
                            right.run(session)
                        }
                    }
                }
            }

            NodeKind::Background { command } => {
                if command.would_execute() {
                    return command.run(session);
                }
                let mut commands = command.run(session).resolve_as_commands(session);
                if let Some(last) = commands.last_mut() {
                    last.should_wait = false;
                }
                Value::CommandSequence(commands)
            }

            NodeKind::CastToCommand { inner } => {
                if inner.is_command() {
                    return inner.run(session);
                }
                let value = inner.run(session).resolve_without_cast(session);
                if value.is_command() {
                    return value;
                }
                Value::Command(Command::from_argv(value.resolve_as_list(session)))
            }

            NodeKind::CastToList { inner } => {
                let Some(inner) = inner else {
                    return Value::empty_list();
                };
                let value = inner.run(session);
                if value.is_command() {
                    return value;
                }
                Value::list_of_strings(value.resolve_as_list(session))
            }

            NodeKind::DoubleQuotedString { inner } => {
                let parts = inner.run(session).resolve_as_list(session);
                Value::string(parts.concat())
            }

            NodeKind::DynamicEvaluate { inner } => {
                let value = inner.run(session).resolve_without_cast(session);
                // Strings name variables; anything else becomes a command.
                if value.is_string() {
                    let mut parts = value.resolve_as_list(session);
                    Value::SimpleVariable(parts.pop().unwrap_or_default())
                } else {
                    Value::Command(Command::from_argv(value.resolve_as_list(session)))
                }
            }

            NodeKind::Execute {
                command,
                capture_stdout,
            } => {
                if *capture_stdout {
                    execute_capturing(command, session)
                } else {
                    execute_node(command, session)
                }
            }

            NodeKind::Join { left, right } => {
                let left_commands = left.run(session).resolve_as_commands(session);
                let right_commands = right.run(session).resolve_as_commands(session);
                Value::CommandSequence(join_commands(left_commands, right_commands))
            }

            NodeKind::Juxtaposition { left, right } => {
                let left_value = left.run(session).resolve_without_cast(session);
                let right_value = right.run(session).resolve_without_cast(session);

                let left_list = left_value.resolve_as_list(session);
                let right_list = right_value.resolve_as_list(session);

                if left_value.is_string() && right_value.is_string() {
                    let mut text = left_list.into_iter().next().unwrap_or_default();
                    text.push_str(&right_list.into_iter().next().unwrap_or_default());
                    return Value::string(text);
                }

                // Otherwise build the Cartesian string product.
                if left_list.is_empty() || right_list.is_empty() {
                    return Value::empty_list();
                }
                let mut product = Vec::with_capacity(left_list.len() * right_list.len());
                for left_element in &left_list {
                    for right_element in &right_list {
                        product.push(format!("{left_element}{right_element}"));
                    }
                }
                Value::list_of_strings(product)
            }

            NodeKind::ListConcatenate { element, list } => {
                let list_value = list.run(session).resolve_without_cast(session);
                let element_value = element.run(session).resolve_without_cast(session);

                if list_value.is_command() || element_value.is_command() {
                    let joined = join_commands(
                        element_value.resolve_as_commands(session),
                        list_value.resolve_as_commands(session),
                    );
                    if joined.len() == 1 {
                        return Value::Command(joined.into_iter().next().unwrap());
                    }
                    return Value::CommandSequence(joined);
                }

                Value::List(vec![element_value, list_value])
            }

            NodeKind::Pipe { left, right } => {
                let mut left_commands = left.run(session).resolve_as_commands(session);
                let mut right_commands = right.run(session).resolve_as_commands(session);

                let mut last_in_left = left_commands.pop().unwrap_or_default();
                let mut first_in_right = if right_commands.is_empty() {
                    Command::default()
                } else {
                    right_commands.remove(0)
                };

                // The writer's rewiring creates the pipe; the reader's slot
                // receives the read end through the shared link.
                let read_slot = fd_slot(-1);
                first_in_right.redirections.push(Redirection::Fd(FdRedirection {
                    source_fd: libc::STDIN_FILENO,
                    dest: read_slot.clone(),
                    action: RewiringAction::Destination,
                    other_end: None,
                }));
                last_in_left.redirections.push(Redirection::Fd(FdRedirection {
                    source_fd: libc::STDOUT_FILENO,
                    dest: fd_slot(-1),
                    action: RewiringAction::RefreshDestination,
                    other_end: Some(read_slot),
                }));
                last_in_left.should_wait = false;
                last_in_left.is_pipe_source = true;

                let mut commands = left_commands;
                commands.push(last_in_left);
                commands.push(first_in_right);
                commands.extend(right_commands);
                Value::CommandSequence(commands)
            }

            NodeKind::Sequence { left, right } => {
                // If this subtree is to return a job, block on the left one
                // then run the right.
                if self.would_execute() {
                    let left_value = execute_node(left, session);
                    if let Value::Job(Some(job)) = &left_value {
                        session.block_on_job(job);
                    }
                    return execute_node(right, session);
                }

                let left_commands = left.run(session).resolve_as_commands(session);
                // A comment next to a command leaves an empty command behind.
                if left_commands.len() == 1
                    && left_commands[0].argv.is_empty()
                    && left_commands[0].redirections.is_empty()
                {
                    return right.run(session);
                }

                let mut commands = left_commands;
                commands.extend(right.run(session).resolve_as_commands(session));
                Value::CommandSequence(commands)
            }

            NodeKind::StringPartCompose { left, right } => {
                let left_parts = left.run(session).resolve_as_list(session);
                let right_parts = right.run(session).resolve_as_list(session);
                let mut text = left_parts.join(" ");
                text.push_str(&right_parts.join(" "));
                Value::string(text)
            }

            NodeKind::VariableDeclarations { variables } => {
                for decl in variables {
                    let name_parts = decl.name.run(session).resolve_as_list(session);
                    let Some(name) = name_parts.into_iter().next() else {
                        continue;
                    };
                    let value = decl.value.run(session);
                    if value.is_list() {
                        let parts = value.resolve_as_list(session);
                        session.set_local_variable(&name, Value::list_of_strings(parts));
                    } else if value.is_command() {
                        session.set_local_variable(&name, value);
                    } else {
                        let parts = value.resolve_as_list(session);
                        session.set_local_variable(
                            &name,
                            Value::string(parts.into_iter().next().unwrap_or_default()),
                        );
                    }
                }
                Value::empty_list()
            }

            NodeKind::ReadRedirection { fd, path } => {
                path_redirection_value(session, path, *fd, RedirectionDirection::Read)
            }
            NodeKind::WriteRedirection { fd, path } => {
                path_redirection_value(session, path, *fd, RedirectionDirection::Write)
            }
            NodeKind::WriteAppendRedirection { fd, path } => {
                path_redirection_value(session, path, *fd, RedirectionDirection::WriteAppend)
            }
            NodeKind::ReadWriteRedirection { fd, path } => {
                path_redirection_value(session, path, *fd, RedirectionDirection::ReadWrite)
            }
            NodeKind::CloseFdRedirection { fd } => {
                Value::Command(Command::from_redirection(Redirection::Close { fd: *fd }))
            }
            NodeKind::Fd2FdRedirection { source_fd, dest_fd } => {
                Value::Command(Command::from_redirection(Redirection::Fd(FdRedirection {
                    source_fd: *source_fd,
                    dest: fd_slot(*dest_fd),
                    action: RewiringAction::None,
                    other_end: None,
                })))
            }
        }
    }
}

fn path_redirection_value(
    session: &mut Session,
    path: &Node,
    fd: i32,
    direction: RedirectionDirection,
) -> Value {
    let segments = path.run(session).resolve_as_list(session);
    Value::Command(Command::from_redirection(Redirection::Path {
        path: segments.join(" "),
        fd,
        direction,
    }))
}

/// The non-capturing execute path: lower the subtree to commands, run them,
/// block on the foreground ones, and hand back the last job.
fn execute_node(command: &Node, session: &mut Session) -> Value {
    if command.would_execute() {
        return command.run(session);
    }

    let resolved = command.run(session).resolve_as_commands(session);
    let commands = session.expand_aliases(resolved);

    let mut last_job = None;
    for job in session.run_commands(&commands) {
        session.block_on_job(&job);
        last_job = Some(job);
    }
    Value::Job(last_job)
}

/// The command-substitution path: reroute the last command's stdout into a
/// pipe, drain it while the jobs run, and return a splittable string.
fn execute_capturing(command: &Node, session: &mut Session) -> Value {
    if command.would_execute() {
        return command.run(session);
    }

    let resolved = command.run(session).resolve_as_commands(session);
    let mut commands = session.expand_aliases(resolved);

    let (read_fd, write_fd) = match sys::pipe() {
        Ok(ends) => ends,
        Err(error) => {
            eprintln!("conch: cannot pipe(): {error}");
            return Value::string("");
        }
    };

    match commands.last_mut() {
        Some(last) => {
            last.redirections.insert(
                0,
                Redirection::Fd(FdRedirection {
                    source_fd: libc::STDOUT_FILENO,
                    dest: fd_slot(write_fd),
                    action: RewiringAction::Destination,
                    other_end: None,
                }),
            );
            last.should_wait = true;
            last.should_notify_if_in_background = false;
            last.is_pipe_source = false;
        }
        None => {
            sys::close(read_fd);
            sys::close(write_fd);
            return Value::string("");
        }
    }

    session.begin_capture(read_fd);
    let jobs = session.run_commands(&commands);
    for job in jobs {
        session.block_on_job(&job);
    }
    let output = session.finish_capture();

    let default_ifs = std::env::var("IFS").unwrap_or_else(|_| "\n".to_string());
    Value::String {
        text: output,
        split: Some(session.local_variable_or("IFS", &default_ifs)),
        keep_empty: session.options.inline_exec_keep_empty_segments,
    }
}

fn child_nodes(kind: &NodeKind) -> Vec<&Node> {
    match kind {
        NodeKind::And { left, right }
        | NodeKind::Or { left, right }
        | NodeKind::Pipe { left, right }
        | NodeKind::Sequence { left, right }
        | NodeKind::Join { left, right }
        | NodeKind::Juxtaposition { left, right }
        | NodeKind::StringPartCompose { left, right } => vec![left.as_ref(), right.as_ref()],
        NodeKind::ListConcatenate { element, list } => vec![element.as_ref(), list.as_ref()],
        NodeKind::Background { command } | NodeKind::Execute { command, .. } => {
            vec![command.as_ref()]
        }
        NodeKind::CastToCommand { inner }
        | NodeKind::DoubleQuotedString { inner }
        | NodeKind::DynamicEvaluate { inner } => vec![inner.as_ref()],
        NodeKind::CastToList { inner } => inner.iter().map(|inner| inner.as_ref()).collect(),
        NodeKind::ReadRedirection { path, .. }
        | NodeKind::WriteRedirection { path, .. }
        | NodeKind::WriteAppendRedirection { path, .. }
        | NodeKind::ReadWriteRedirection { path, .. } => vec![path.as_ref()],
        NodeKind::VariableDeclarations { variables } => variables
            .iter()
            .flat_map(|decl| [&decl.name, &decl.value])
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::session::Session;

    fn node(kind: NodeKind) -> Node {
        Node::new(kind, Position::new(0, 0))
    }

    fn bareword(text: &str) -> Node {
        node(NodeKind::BarewordLiteral { text: text.into() })
    }

    #[test]
    fn syntax_errors_propagate_to_ancestors() {
        let error = node(NodeKind::SyntaxError {
            message: "expected a closing quote".into(),
        });
        let juxtaposition = node(NodeKind::Juxtaposition {
            left: Box::new(bareword("ok")),
            right: Box::new(error),
        });
        assert!(juxtaposition.is_syntax_error());
        assert_eq!(
            juxtaposition.syntax_error().unwrap().message,
            "expected a closing quote"
        );
    }

    #[test]
    fn clean_trees_carry_no_error() {
        let juxtaposition = node(NodeKind::Juxtaposition {
            left: Box::new(bareword("a")),
            right: Box::new(bareword("b")),
        });
        assert!(!juxtaposition.is_syntax_error());
    }

    #[test]
    fn only_execute_like_nodes_would_execute() {
        let command = node(NodeKind::CastToCommand {
            inner: Box::new(bareword("ls")),
        });
        assert!(!command.would_execute());

        let execute = node(NodeKind::Execute {
            command: Box::new(command.clone()),
            capture_stdout: false,
        });
        assert!(execute.would_execute());

        let sequence = node(NodeKind::Sequence {
            left: Box::new(command),
            right: Box::new(execute),
        });
        assert!(sequence.would_execute());
    }

    #[test]
    fn juxtaposition_of_strings_concatenates() {
        let mut session = Session::new().unwrap();
        let juxtaposition = node(NodeKind::Juxtaposition {
            left: Box::new(bareword("foo")),
            right: Box::new(bareword("bar")),
        });
        let value = juxtaposition.run(&mut session);
        assert_eq!(value.resolve_as_list(&session), vec!["foobar"]);
    }

    #[test]
    fn juxtaposition_of_lists_builds_a_product() {
        let mut session = Session::new().unwrap();
        session.set_local_variable(
            "suffixes",
            Value::list_of_strings(vec!["1".into(), "2".into()]),
        );
        let juxtaposition = node(NodeKind::Juxtaposition {
            left: Box::new(bareword("x")),
            right: Box::new(node(NodeKind::SimpleVariable {
                name: "suffixes".into(),
            })),
        });
        let value = juxtaposition.run(&mut session);
        assert_eq!(value.resolve_as_list(&session), vec!["x1", "x2"]);
    }

    #[test]
    fn variable_declarations_bind_in_order() {
        let mut session = Session::new().unwrap();
        let decls = node(NodeKind::VariableDeclarations {
            variables: vec![
                VariableDecl {
                    name: bareword("X"),
                    value: bareword("1"),
                },
                VariableDecl {
                    name: bareword("Y"),
                    value: node(NodeKind::SimpleVariable { name: "X".into() }),
                },
            ],
        });
        decls.run(&mut session);
        let y = Value::SimpleVariable("Y".into());
        assert_eq!(y.resolve_as_list(&session), vec!["1"]);
    }

    #[test]
    fn leftmost_trivial_literal_finds_the_program_name() {
        let list = node(NodeKind::ListConcatenate {
            element: Box::new(bareword("grep")),
            list: Box::new(bareword("-r")),
        });
        let command = node(NodeKind::CastToCommand {
            inner: Box::new(list),
        });
        let literal = command.leftmost_trivial_literal().unwrap();
        assert!(matches!(
            &literal.kind,
            NodeKind::BarewordLiteral { text } if text == "grep"
        ));
    }

    #[test]
    fn redirection_nodes_evaluate_to_redirection_commands() {
        let mut session = Session::new().unwrap();
        let redirection = node(NodeKind::WriteRedirection {
            fd: 1,
            path: Box::new(bareword("/tmp/out")),
        });
        let value = redirection.run(&mut session);
        let commands = value.resolve_as_commands(&session);
        assert_eq!(commands.len(), 1);
        assert!(commands[0].argv.is_empty());
        assert_eq!(commands[0].redirections.len(), 1);
    }
}
