use std::env;

use crate::command::Command;
use crate::exec::job::JobRef;
use crate::expand;
use crate::state::session::Session;

/// Runtime value produced by evaluating an AST node.
///
/// Values are cheap to clone: jobs are shared handles, and everything else
/// is plain data. The session's local variable table stores `Value`s
/// directly, which is what lets a list or a command be bound to a name.
#[derive(Debug, Clone)]
pub enum Value {
    String {
        text: String,
        /// IFS characters to split on; set only for stdout-captured
        /// command substitutions.
        split: Option<String>,
        keep_empty: bool,
    },
    List(Vec<Value>),
    Glob(String),
    Tilde(String),
    SimpleVariable(String),
    SpecialVariable(char),
    Command(Command),
    CommandSequence(Vec<Command>),
    Job(Option<JobRef>),
}

impl Value {
    pub fn string(text: impl Into<String>) -> Self {
        Value::String {
            text: text.into(),
            split: None,
            keep_empty: false,
        }
    }

    pub fn list_of_strings(strings: Vec<String>) -> Self {
        Value::List(strings.into_iter().map(Value::string).collect())
    }

    pub fn empty_list() -> Self {
        Value::List(Vec::new())
    }

    /// A plain (non-splittable) string is a single word; a captured string
    /// carrying an IFS acts as a list instead.
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String { split: None, .. })
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_) | Value::String { split: Some(_), .. })
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Value::Command(_) | Value::CommandSequence(_))
    }

    pub fn is_job(&self) -> bool {
        matches!(self, Value::Job(_))
    }

    /// Flattens the value into a vector of words.
    pub fn resolve_as_list(&self, session: &Session) -> Vec<String> {
        match self {
            Value::String {
                text,
                split: Some(separators),
                keep_empty,
            } => split_with_separators(text, separators, *keep_empty),
            Value::String { text, .. } => vec![text.clone()],
            Value::List(values) => values
                .iter()
                .flat_map(|value| value.resolve_as_list(session))
                .collect(),
            Value::Glob(pattern) => expand::expand_globs(pattern, &session.cwd_string()),
            Value::Tilde(username) => {
                vec![expand::expand_tilde(&format!("~{username}"))]
            }
            Value::SimpleVariable(name) => {
                if let Some(value) = session.lookup_local_variable(name) {
                    return value.resolve_as_list(session);
                }
                match env::var(name) {
                    // POSIX-style word split on the raw environment value.
                    Ok(text) => {
                        let words: Vec<String> = text
                            .split(' ')
                            .filter(|part| !part.is_empty())
                            .map(str::to_string)
                            .collect();
                        if words.is_empty() {
                            vec![String::new()]
                        } else {
                            words
                        }
                    }
                    // An unset variable resolves to a single empty word.
                    Err(_) => vec![String::new()],
                }
            }
            Value::SpecialVariable(name) => match name {
                '?' => vec![session.last_return_code.to_string()],
                '$' => vec![session.pid.to_string()],
                _ => vec![String::new()],
            },
            Value::Job(job) => {
                let code = job
                    .as_ref()
                    .and_then(|job| job.borrow().exit_code)
                    .unwrap_or(0);
                vec![code.to_string()]
            }
            Value::Command(_) | Value::CommandSequence(_) => {
                eprintln!("conch: cannot use a command as a list");
                Vec::new()
            }
        }
    }

    /// Lowers the value into the command list the job runner consumes.
    /// Values that are plain word lists become the argv of one command.
    pub fn resolve_as_commands(&self, session: &Session) -> Vec<Command> {
        match self {
            Value::Command(command) => vec![command.clone()],
            Value::CommandSequence(commands) => commands.clone(),
            _ => vec![Command::from_argv(self.resolve_as_list(session))],
        }
    }

    /// Only variables look themselves up; every other value is already in
    /// its final shape.
    pub fn resolve_without_cast(&self, session: &Session) -> Value {
        if let Value::SimpleVariable(name) = self {
            if let Some(value) = session.lookup_local_variable(name) {
                return value.clone();
            }
        }
        self.clone()
    }
}

fn split_with_separators(text: &str, separators: &str, keep_empty: bool) -> Vec<String> {
    if separators.is_empty() {
        return vec![text.to_string()];
    }
    text.split(|c| separators.contains(c))
        .filter(|part| keep_empty || !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_session() -> Session {
        Session::new().expect("session should initialize")
    }

    #[test]
    fn plain_string_is_a_single_word() {
        let session = test_session();
        let value = Value::string("hello world");
        assert!(value.is_string());
        assert_eq!(value.resolve_as_list(&session), vec!["hello world"]);
    }

    #[test]
    fn captured_string_splits_on_ifs() {
        let session = test_session();
        let value = Value::String {
            text: "a\nb\n\nc".into(),
            split: Some("\n".into()),
            keep_empty: false,
        };
        assert!(value.is_list());
        assert_eq!(value.resolve_as_list(&session), vec!["a", "b", "c"]);
    }

    #[test]
    fn captured_string_can_keep_empty_segments() {
        let session = test_session();
        let value = Value::String {
            text: "a\n\nb".into(),
            split: Some("\n".into()),
            keep_empty: true,
        };
        assert_eq!(value.resolve_as_list(&session), vec!["a", "", "b"]);
    }

    #[test]
    fn unset_variable_resolves_to_one_empty_word() {
        let session = test_session();
        let value = Value::SimpleVariable("CONCH_TEST_DEFINITELY_UNSET".into());
        assert_eq!(value.resolve_as_list(&session), vec![""]);
    }

    #[test]
    fn bound_variable_delegates_to_its_value() {
        let mut session = test_session();
        session.set_local_variable(
            "words",
            Value::list_of_strings(vec!["a".into(), "b".into()]),
        );
        let value = Value::SimpleVariable("words".into());
        assert_eq!(value.resolve_as_list(&session), vec!["a", "b"]);
        assert!(value.resolve_without_cast(&session).is_list());
    }

    #[test]
    fn command_value_is_not_a_list() {
        let session = test_session();
        let value = Value::Command(Command::from_argv(vec!["ls".into()]));
        assert!(value.resolve_as_list(&session).is_empty());
        assert_eq!(value.resolve_as_commands(&session).len(), 1);
    }

    #[test]
    fn word_list_lowers_to_a_single_command() {
        let session = test_session();
        let value = Value::list_of_strings(vec!["echo".into(), "hi".into()]);
        let commands = value.resolve_as_commands(&session);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].argv, vec!["echo", "hi"]);
        assert!(commands[0].redirections.is_empty());
    }

    #[test]
    fn special_variable_question_mark_reads_last_return_code() {
        let mut session = test_session();
        session.last_return_code = 42;
        let value = Value::SpecialVariable('?');
        assert_eq!(value.resolve_as_list(&session), vec!["42"]);
    }
}
