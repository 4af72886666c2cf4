use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;

use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{CompletionType, Config, Context, Editor, Helper};

use crate::complete;
use crate::errors::{Result, ShellError};
use crate::highlight;
use crate::state::session::Session;

/// Routes the editor's suggestion and syntax-highlight callbacks into the
/// AST by hit-testing the current line. Only ever borrows the session
/// immutably; nothing here executes commands.
struct ShellHelper {
    session: Rc<RefCell<Session>>,
}

impl Completer for ShellHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let session = self.session.borrow();
        let completion = complete::complete_line(&session, line, pos);
        let pairs = completion
            .suggestions
            .into_iter()
            .map(|suggestion| Pair {
                display: suggestion.text.clone(),
                replacement: format!("{}{}", suggestion.text, suggestion.trailing),
            })
            .collect();
        Ok((completion.replace_from, pairs))
    }
}

impl Highlighter for ShellHelper {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        let session = self.session.borrow();
        Cow::Owned(highlight::highlight_line(&session, line))
    }

    fn highlight_char(&self, line: &str, _pos: usize) -> bool {
        !line.is_empty()
    }
}

impl Hinter for ShellHelper {
    type Hint = String;
}

impl Validator for ShellHelper {}
impl Helper for ShellHelper {}

/// The interactive line editor: prompt display, history, completion and
/// highlighting, backed by rustyline.
pub struct LineEditor {
    editor: Editor<ShellHelper, DefaultHistory>,
}

impl LineEditor {
    pub fn new(session: Rc<RefCell<Session>>) -> Result<Self> {
        let config = Config::builder()
            .history_ignore_space(true)
            .completion_type(CompletionType::List)
            .build();

        let mut editor: Editor<ShellHelper, DefaultHistory> = Editor::with_config(config)
            .map_err(|error| ShellError::Editor(error.to_string()))?;
        editor.set_helper(Some(ShellHelper {
            session: session.clone(),
        }));

        let history_path = session.borrow().history_path();
        // A missing history file is normal on first launch.
        let _ = editor.load_history(&history_path);

        Ok(Self { editor })
    }

    pub fn read_line(
        &mut self,
        prompt: &str,
    ) -> std::result::Result<String, ReadlineError> {
        self.editor.readline(prompt)
    }

    pub fn remember(&mut self, line: &str) {
        let _ = self.editor.add_history_entry(line);
    }
}
