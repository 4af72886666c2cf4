use std::collections::BTreeSet;
use std::env;
use std::fs;

use crate::ast::{Node, NodeKind};
use crate::builtins;
use crate::expand;
use crate::parser;
use crate::state::options::Options;
use crate::state::session::Session;

/// One completion candidate. The trailing character is `/` for directories
/// and a space for everything else, so accepting a suggestion leaves the
/// cursor ready for the next token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub text: String,
    pub trailing: char,
}

impl Suggestion {
    fn word(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            trailing: ' ',
        }
    }
}

/// A batch of suggestions replacing the line from `replace_from` to the
/// cursor.
#[derive(Debug, Default)]
pub struct Completion {
    pub replace_from: usize,
    pub suggestions: Vec<Suggestion>,
}

/// Parses the line up to the cursor, hit-tests the cursor position, and
/// dispatches on what the cursor is inside of.
pub fn complete_line(session: &Session, line: &str, cursor: usize) -> Completion {
    let empty = Completion {
        replace_from: cursor,
        suggestions: Vec::new(),
    };
    let Some(prefix) = line.get(..cursor.min(line.len())) else {
        return empty;
    };
    let Some(ast) = parser::parse(prefix) else {
        return empty;
    };

    let result = ast.hit_test(cursor);
    let Some(matching) = result.matching_node else {
        return empty;
    };

    if let Some(semantic) = result.closest_node_with_semantic_meaning {
        match &semantic.kind {
            // `~user/pa<tab>`: resolve the tilde, then complete the path
            // under that prefix.
            NodeKind::Juxtaposition { left, right }
                if left.is_tilde() && right.is_bareword() =>
            {
                if let (NodeKind::Tilde { username }, NodeKind::BarewordLiteral { text }) =
                    (&left.kind, &right.kind)
                {
                    let base = expand::expand_tilde(&format!("~{username}"));
                    let corrected = cursor.saturating_sub(right.position.start);
                    return complete_path(session, &base, text, corrected, cursor);
                }
            }
            NodeKind::ReadRedirection { .. }
            | NodeKind::WriteRedirection { .. }
            | NodeKind::WriteAppendRedirection { .. }
            | NodeKind::ReadWriteRedirection { .. } => {
                if let NodeKind::BarewordLiteral { text } = &matching.kind {
                    let corrected = cursor.saturating_sub(matching.position.start);
                    return complete_path(session, "", text, corrected, cursor);
                }
                return empty;
            }
            // The cursor is on the program name itself.
            NodeKind::CastToCommand { .. } | NodeKind::Execute { .. } => {
                if let NodeKind::BarewordLiteral { text } = &matching.kind {
                    let corrected = cursor.saturating_sub(matching.position.start);
                    return complete_program_name(session, text, corrected, cursor);
                }
                return empty;
            }
            NodeKind::SimpleVariable { name } => {
                let corrected = cursor.saturating_sub(semantic.position.start + 1);
                return complete_variable(session, name, corrected, cursor);
            }
            NodeKind::Tilde { username } => {
                let corrected = cursor.saturating_sub(semantic.position.start + 1);
                return complete_user(username, corrected, cursor);
            }
            _ => {}
        }
    }

    // Generic argument completion: options for `-`-words, paths otherwise.
    let NodeKind::BarewordLiteral { text } = &matching.kind else {
        return empty;
    };
    let corrected = cursor.saturating_sub(matching.position.start);
    if corrected > text.len() {
        return empty;
    }

    if text.starts_with('-') && text != "-" {
        let program_name = result
            .closest_command_node
            .and_then(Node::leftmost_trivial_literal)
            .and_then(literal_text);
        let Some(program_name) = program_name else {
            return empty;
        };
        return complete_option(&program_name, text, corrected, cursor);
    }

    complete_path(session, "", text, corrected, cursor)
}

fn literal_text(node: &Node) -> Option<String> {
    match &node.kind {
        NodeKind::BarewordLiteral { text } | NodeKind::StringLiteral { text } => {
            Some(text.clone())
        }
        _ => None,
    }
}

/// Path completion relative to `base` (or the cwd when base is empty). Only
/// the last `/`-separated segment of the typed token is replaced.
fn complete_path(
    session: &Session,
    base: &str,
    part: &str,
    offset: usize,
    cursor: usize,
) -> Completion {
    let token = &part[..offset.min(part.len())];
    let last_slash = token.rfind('/');
    let (directory_part, file_part) = match last_slash {
        Some(index) => (&token[..index + 1], &token[index + 1..]),
        None => ("", token),
    };

    let mut search_path = String::new();
    if base.is_empty() {
        if !token.starts_with('/') {
            search_path.push_str(&session.cwd_string());
        }
    } else {
        if !base.starts_with('/') {
            search_path.push_str(&session.cwd_string());
            search_path.push('/');
        }
        search_path.push_str(base);
    }
    search_path.push('/');
    search_path.push_str(directory_part);

    // Dotfiles only show up when the typed segment starts with a dot.
    let show_hidden = file_part.starts_with('.');

    let mut suggestions = Vec::new();
    if let Ok(entries) = fs::read_dir(&search_path) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(file_part) {
                continue;
            }
            if name.starts_with('.') && !show_hidden {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            suggestions.push(Suggestion {
                text: expand::escape_token(name),
                trailing: if file_type.is_dir() { '/' } else { ' ' },
            });
        }
    }
    suggestions.sort_by(|a, b| a.text.cmp(&b.text));

    Completion {
        replace_from: cursor - file_part.len(),
        suggestions,
    }
}

/// Program-name completion out of the session's sorted path cache, falling
/// back to path completion when nothing matches.
fn complete_program_name(
    session: &Session,
    name: &str,
    offset: usize,
    cursor: usize,
) -> Completion {
    let token = &name[..offset.min(name.len())];

    // Binary-search to the first cache entry with our prefix, then expand
    // forward across the shared-prefix run.
    let start = session
        .cached_path
        .partition_point(|entry| entry.as_str() < token);
    let matches: Vec<Suggestion> = session.cached_path[start..]
        .iter()
        .take_while(|entry| entry.starts_with(token))
        .map(|entry| Suggestion::word(entry.clone()))
        .collect();

    if matches.is_empty() {
        return complete_path(session, "", name, offset, cursor);
    }

    Completion {
        replace_from: cursor - token.len(),
        suggestions: matches,
    }
}

/// Variable-name completion from session locals plus the environment.
fn complete_variable(session: &Session, name: &str, offset: usize, cursor: usize) -> Completion {
    let pattern = &name[..offset.min(name.len())];

    let mut names = BTreeSet::new();
    for key in session.local_variables.keys() {
        if key.starts_with(pattern) {
            names.insert(key.clone());
        }
    }
    for (key, _) in env::vars() {
        if key.starts_with(pattern) && !key.is_empty() {
            names.insert(key);
        }
    }

    Completion {
        replace_from: cursor - pattern.len(),
        suggestions: names.into_iter().map(Suggestion::word).collect(),
    }
}

/// Username completion from `/home/*`.
fn complete_user(name: &str, offset: usize, cursor: usize) -> Completion {
    let pattern = &name[..offset.min(name.len())];
    let mut suggestions = Vec::new();
    if let Ok(entries) = fs::read_dir("/home") {
        for entry in entries.flatten() {
            let user = entry.file_name();
            let Some(user) = user.to_str() else { continue };
            if user.starts_with(pattern) {
                suggestions.push(Suggestion::word(user));
            }
        }
    }
    suggestions.sort_by(|a, b| a.text.cmp(&b.text));
    Completion {
        replace_from: cursor - pattern.len(),
        suggestions,
    }
}

/// Option completion. Only builtins publish their options; today that is
/// `setopt` with the shell option set, negatable through a `no_` prefix.
fn complete_option(program_name: &str, option: &str, offset: usize, cursor: usize) -> Completion {
    let token = &option[..offset.min(option.len())];
    let empty = Completion {
        replace_from: cursor,
        suggestions: Vec::new(),
    };

    if !builtins::has_builtin(program_name) || program_name != "setopt" {
        return empty;
    }

    let dashes = token.chars().take_while(|c| *c == '-').count().min(2);
    let mut pattern = &token[dashes..];
    let negated = pattern.starts_with("no_");
    if negated {
        pattern = &pattern[3..];
    }

    let suggestions = Options::NAMES
        .iter()
        .filter(|name| name.starts_with(pattern))
        .map(|name| {
            let prefix = if negated { "--no_" } else { "--" };
            Suggestion::word(format!("{prefix}{name}"))
        })
        .collect();

    Completion {
        replace_from: cursor - token.len(),
        suggestions,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;

    fn test_session() -> Session {
        Session::new().unwrap()
    }

    #[test]
    fn program_names_complete_from_the_cache() {
        let session = test_session();
        // `cd` is a builtin, so the cache always carries it.
        let completion = complete_line(&session, "cd", 2);
        assert!(completion
            .suggestions
            .iter()
            .any(|suggestion| suggestion.text == "cd"));
        assert_eq!(completion.replace_from, 0);
    }

    #[test]
    fn arguments_complete_as_paths() {
        let scratch = tempfile::tempdir().unwrap();
        File::create(scratch.path().join("notes.txt")).unwrap();
        fs::create_dir(scratch.path().join("nested")).unwrap();

        let mut session = test_session();
        session.cwd = scratch.path().to_path_buf();

        let completion = complete_line(&session, "cat n", 5);
        let names: Vec<&str> = completion
            .suggestions
            .iter()
            .map(|suggestion| suggestion.text.as_str())
            .collect();
        assert_eq!(names, vec!["nested", "notes.txt"]);
        assert_eq!(completion.suggestions[0].trailing, '/');
        assert_eq!(completion.suggestions[1].trailing, ' ');
        assert_eq!(completion.replace_from, 4);
    }

    #[test]
    fn variables_complete_from_locals_and_environment() {
        let mut session = test_session();
        session.set_local_variable("my_unique_var", crate::value::Value::string("x"));

        let completion = complete_line(&session, "echo $my_uni", 12);
        assert!(completion
            .suggestions
            .iter()
            .any(|suggestion| suggestion.text == "my_unique_var"));
    }

    #[test]
    fn setopt_options_complete_with_negation() {
        let session = test_session();
        let line = "setopt --no_ver";
        let completion = complete_line(&session, line, line.len());
        assert_eq!(
            completion
                .suggestions
                .iter()
                .map(|suggestion| suggestion.text.as_str())
                .collect::<Vec<_>>(),
            vec!["--no_verbose"]
        );
    }

    #[test]
    fn redirection_targets_complete_as_paths() {
        let scratch = tempfile::tempdir().unwrap();
        File::create(scratch.path().join("output.log")).unwrap();

        let mut session = test_session();
        session.cwd = scratch.path().to_path_buf();

        let line = "echo hi > out";
        let completion = complete_line(&session, line, line.len());
        assert!(completion
            .suggestions
            .iter()
            .any(|suggestion| suggestion.text == "output.log"));
    }

    #[test]
    fn cursor_outside_any_node_completes_nothing() {
        let session = test_session();
        let completion = complete_line(&session, "echo", 40);
        assert!(completion.suggestions.is_empty());
    }
}
