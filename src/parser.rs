use crate::ast::{Node, NodeKind, Position, VariableDecl};

/// Parses a line (or a whole script) into an AST.
///
/// Returns `None` for blank input. Parse failures never abort: they become
/// `SyntaxError` nodes inside the tree so cursor-driven features still work
/// over broken input. The toplevel tree is wrapped in a non-capturing
/// `Execute`, and `&&`/`||` operands are `Execute`-wrapped as needed, so
/// running the root yields a job.
pub fn parse(input: &str) -> Option<Node> {
    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
        dynamic_depth: 0,
    };
    parser.skip_whitespace();
    if parser.at_end() {
        return None;
    }
    let root = parser.parse_sequence();
    parser.skip_whitespace();

    // Anything left over is broken input; keep it in the tree as an error
    // node rather than silently dropping it.
    let root = if parser.at_end() {
        root?
    } else {
        let error_start = parser.pos;
        parser.pos = parser.bytes.len();
        let error = parser.syntax_error(error_start, "unexpected trailing input");
        match root {
            Some(root) => sequence(root, error),
            None => error,
        }
    };

    let position = root.position;
    Some(Node::new(
        NodeKind::Execute {
            command: Box::new(root),
            capture_stdout: false,
        },
        position,
    ))
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Depth of `${...}` nesting; `}` only terminates words inside one.
    dynamic_depth: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_blanks(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.advance();
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n')) {
            self.advance();
        }
    }

    fn text(&self, position: Position) -> &'a str {
        std::str::from_utf8(&self.bytes[position.start..position.end]).unwrap_or("")
    }

    fn syntax_error(&mut self, start: usize, message: &str) -> Node {
        Node::new(
            NodeKind::SyntaxError {
                message: message.to_string(),
            },
            Position::new(start, self.pos.max(start)),
        )
    }

    fn parse_sequence(&mut self) -> Option<Node> {
        self.skip_blanks();
        let mut left = if self.peek() == Some(b'#') {
            self.parse_comment()
        } else {
            self.parse_and_or()?
        };

        loop {
            self.skip_blanks();
            match self.peek() {
                Some(b'&') if self.peek_at(1) != Some(b'&') => {
                    self.advance();
                    let position = Position::new(left.position.start, self.pos);
                    left = Node::new(
                        NodeKind::Background {
                            command: Box::new(left),
                        },
                        position,
                    );
                }
                Some(b';') | Some(b'\n') => {
                    self.advance();
                }
                Some(b'#') => {
                    let comment = self.parse_comment();
                    left = sequence(left, comment);
                }
                Some(b')') | Some(b'}') => break,
                None => break,
                _ => {
                    // A fresh command after a separator.
                    let Some(right) = self.parse_sequence() else {
                        break;
                    };
                    left = sequence(left, right);
                    break;
                }
            }
        }
        Some(left)
    }

    fn parse_comment(&mut self) -> Node {
        let start = self.pos;
        while !matches!(self.peek(), None | Some(b'\n')) {
            self.advance();
        }
        let position = Position::new(start, self.pos);
        Node::new(
            NodeKind::Comment {
                text: self.text(position).to_string(),
            },
            position,
        )
    }

    fn parse_and_or(&mut self) -> Option<Node> {
        let mut left = self.parse_pipeline()?;
        loop {
            self.skip_blanks();
            let kind = match (self.peek(), self.peek_at(1)) {
                (Some(b'&'), Some(b'&')) => b'&',
                (Some(b'|'), Some(b'|')) => b'|',
                _ => break,
            };
            self.advance();
            self.advance();
            self.skip_blanks();
            let operator_end = self.pos;
            let right = self
                .parse_pipeline()
                .unwrap_or_else(|| self.syntax_error(operator_end, "expected a command after logical operator"));
            let position = Position::new(left.position.start, right.position.end);
            let left_boxed = ensure_execute(left);
            let right_boxed = ensure_execute(right);
            left = Node::new(
                if kind == b'&' {
                    NodeKind::And {
                        left: left_boxed,
                        right: right_boxed,
                    }
                } else {
                    NodeKind::Or {
                        left: left_boxed,
                        right: right_boxed,
                    }
                },
                position,
            );
        }
        Some(left)
    }

    fn parse_pipeline(&mut self) -> Option<Node> {
        let mut left = self.parse_command()?;
        loop {
            self.skip_blanks();
            if self.peek() != Some(b'|') || self.peek_at(1) == Some(b'|') {
                break;
            }
            self.advance();
            self.skip_blanks();
            let operator_end = self.pos;
            let right = self
                .parse_command()
                .unwrap_or_else(|| self.syntax_error(operator_end, "expected a command after '|'"));
            let position = Position::new(left.position.start, right.position.end);
            left = Node::new(
                NodeKind::Pipe {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                position,
            );
        }
        Some(left)
    }

    fn parse_command(&mut self) -> Option<Node> {
        self.skip_blanks();
        let start = self.pos;

        let mut variables = Vec::new();
        loop {
            let Some(decl) = self.try_parse_variable_decl() else {
                break;
            };
            variables.push(decl);
            self.skip_blanks();
        }
        let declarations = if variables.is_empty() {
            None
        } else {
            Some(Node::new(
                NodeKind::VariableDeclarations { variables },
                Position::new(start, self.pos),
            ))
        };

        let mut words = Vec::new();
        let mut redirections = Vec::new();
        loop {
            self.skip_blanks();
            match self.peek() {
                None | Some(b';') | Some(b'\n') | Some(b'#') | Some(b')') | Some(b'&')
                | Some(b'|') => break,
                Some(b'}') if self.dynamic_depth > 0 => break,
                _ => {
                    if let Some(redirection) = self.try_parse_redirection() {
                        redirections.push(redirection);
                    } else {
                        let Some(word) = self.parse_expression() else {
                            break;
                        };
                        words.push(word);
                    }
                }
            }
        }

        let mut node = fold_word_list(words).map(|list| {
            let position = list.position;
            Node::new(
                NodeKind::CastToCommand {
                    inner: Box::new(list),
                },
                position,
            )
        });
        for redirection in redirections {
            node = Some(match node {
                Some(existing) => {
                    let position =
                        Position::new(existing.position.start, redirection.position.end);
                    Node::new(
                        NodeKind::Join {
                            left: Box::new(existing),
                            right: Box::new(redirection),
                        },
                        position,
                    )
                }
                None => redirection,
            });
        }

        match (declarations, node) {
            (Some(declarations), Some(command)) => Some(sequence(declarations, command)),
            (Some(declarations), None) => Some(declarations),
            (None, command) => command,
        }
    }

    /// `NAME=value` at command position. The name node's span includes the
    /// `=` so the highlighter can color it.
    fn try_parse_variable_decl(&mut self) -> Option<VariableDecl> {
        let start = self.pos;
        let mut cursor = self.pos;
        match self.bytes.get(cursor) {
            Some(c) if c.is_ascii_alphabetic() || *c == b'_' => cursor += 1,
            _ => return None,
        }
        while matches!(self.bytes.get(cursor), Some(c) if c.is_ascii_alphanumeric() || *c == b'_')
        {
            cursor += 1;
        }
        if self.bytes.get(cursor) != Some(&b'=') {
            return None;
        }

        let name_text =
            std::str::from_utf8(&self.bytes[start..cursor]).unwrap_or_default().to_string();
        self.pos = cursor + 1;
        let name = Node::new(
            NodeKind::BarewordLiteral { text: name_text },
            Position::new(start, self.pos),
        );

        let value = match self.peek() {
            None | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b';') | Some(b'&')
            | Some(b'|') | Some(b'#') => Node::new(
                NodeKind::StringLiteral {
                    text: String::new(),
                },
                Position::new(self.pos, self.pos),
            ),
            _ => self
                .parse_expression()
                .unwrap_or_else(|| self.syntax_error(self.pos, "expected a value")),
        };
        Some(VariableDecl { name, value })
    }

    fn try_parse_redirection(&mut self) -> Option<Node> {
        let start = self.pos;
        let mut cursor = self.pos;
        while matches!(self.bytes.get(cursor), Some(c) if c.is_ascii_digit()) {
            cursor += 1;
        }
        let operator = match self.bytes.get(cursor) {
            Some(operator @ (b'>' | b'<')) => *operator,
            _ => return None,
        };
        let explicit_fd = if cursor > start {
            std::str::from_utf8(&self.bytes[start..cursor])
                .ok()
                .and_then(|digits| digits.parse::<i32>().ok())
        } else {
            None
        };
        self.pos = cursor + 1;

        if operator == b'>' {
            let fd = explicit_fd.unwrap_or(1);
            if self.eat(b'>') {
                return Some(self.finish_path_redirection(start, fd, RedirKind::WriteAppend));
            }
            if self.eat(b'&') {
                if self.eat(b'-') {
                    return Some(Node::new(
                        NodeKind::CloseFdRedirection { fd },
                        Position::new(start, self.pos),
                    ));
                }
                let digits_start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.advance();
                }
                if digits_start == self.pos {
                    return Some(self.syntax_error(start, "expected a file descriptor after '>&'"));
                }
                let dest_fd = std::str::from_utf8(&self.bytes[digits_start..self.pos])
                    .ok()
                    .and_then(|digits| digits.parse().ok())
                    .unwrap_or(1);
                return Some(Node::new(
                    NodeKind::Fd2FdRedirection {
                        source_fd: fd,
                        dest_fd,
                    },
                    Position::new(start, self.pos),
                ));
            }
            return Some(self.finish_path_redirection(start, fd, RedirKind::Write));
        }

        let fd = explicit_fd.unwrap_or(0);
        if self.eat(b'>') {
            return Some(self.finish_path_redirection(start, fd, RedirKind::ReadWrite));
        }
        Some(self.finish_path_redirection(start, fd, RedirKind::Read))
    }

    fn finish_path_redirection(&mut self, start: usize, fd: i32, kind: RedirKind) -> Node {
        self.skip_blanks();
        let Some(path) = self.parse_expression() else {
            return self.syntax_error(start, "expected a path after redirection");
        };
        let position = Position::new(start, path.position.end);
        let path = Box::new(path);
        let kind = match kind {
            RedirKind::Read => NodeKind::ReadRedirection { fd, path },
            RedirKind::Write => NodeKind::WriteRedirection { fd, path },
            RedirKind::WriteAppend => NodeKind::WriteAppendRedirection { fd, path },
            RedirKind::ReadWrite => NodeKind::ReadWriteRedirection { fd, path },
        };
        Node::new(kind, position)
    }

    /// One whitespace-delimited word: adjacent atoms compose through
    /// `Juxtaposition`.
    fn parse_expression(&mut self) -> Option<Node> {
        let mut parts: Vec<Node> = Vec::new();
        loop {
            if self.at_word_boundary() {
                break;
            }
            let Some(atom) = self.parse_atom(parts.is_empty()) else {
                break;
            };
            parts.push(atom);
        }

        let mut iter = parts.into_iter();
        let mut node = iter.next()?;
        for part in iter {
            let position = Position::new(node.position.start, part.position.end);
            node = Node::new(
                NodeKind::Juxtaposition {
                    left: Box::new(node),
                    right: Box::new(part),
                },
                position,
            );
        }
        Some(node)
    }

    fn at_word_boundary(&self) -> bool {
        match self.peek() {
            None => true,
            Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b';') | Some(b'|') | Some(b'&')
            | Some(b'<') | Some(b'>') | Some(b')') | Some(b'#') => true,
            Some(b'}') => self.dynamic_depth > 0,
            _ => false,
        }
    }

    fn parse_atom(&mut self, at_word_start: bool) -> Option<Node> {
        match self.peek()? {
            b'\'' => Some(self.parse_single_quoted()),
            b'"' => Some(self.parse_double_quoted()),
            b'$' => Some(self.parse_dollar()),
            b'(' => Some(self.parse_list_literal()),
            b'~' if at_word_start => Some(self.parse_tilde()),
            _ => self.parse_bareword(),
        }
    }

    fn parse_single_quoted(&mut self) -> Node {
        let start = self.pos;
        self.advance();
        let content_start = self.pos;
        while !matches!(self.peek(), None | Some(b'\'')) {
            self.advance();
        }
        let content = self.text(Position::new(content_start, self.pos)).to_string();
        if !self.eat(b'\'') {
            return self.syntax_error(start, "expected a terminating single quote");
        }
        Node::new(
            NodeKind::StringLiteral { text: content },
            Position::new(start, self.pos),
        )
    }

    fn parse_double_quoted(&mut self) -> Node {
        let start = self.pos;
        self.advance();
        let mut parts: Vec<Node> = Vec::new();
        let mut literal: Vec<u8> = Vec::new();
        let mut literal_start = self.pos;

        loop {
            match self.peek() {
                None => return self.syntax_error(start, "expected a terminating double quote"),
                Some(b'"') => break,
                Some(b'$') => {
                    if !literal.is_empty() || parts.is_empty() {
                        parts.push(Node::new(
                            NodeKind::StringLiteral {
                                text: String::from_utf8_lossy(&std::mem::take(&mut literal))
                                    .into_owned(),
                            },
                            Position::new(literal_start, self.pos),
                        ));
                    }
                    parts.push(self.parse_dollar());
                    literal_start = self.pos;
                }
                Some(b'\\') => {
                    self.advance();
                    if let Some(escaped) = self.peek() {
                        literal.push(escaped);
                        self.advance();
                    }
                }
                Some(byte) => {
                    literal.push(byte);
                    self.advance();
                }
            }
        }

        if !literal.is_empty() || parts.is_empty() {
            parts.push(Node::new(
                NodeKind::StringLiteral {
                    text: String::from_utf8_lossy(&literal).into_owned(),
                },
                Position::new(literal_start, self.pos),
            ));
        }
        self.advance(); // closing quote

        let mut iter = parts.into_iter();
        let mut inner = iter.next().expect("at least one part");
        for part in iter {
            let position = Position::new(inner.position.start, part.position.end);
            inner = Node::new(
                NodeKind::StringPartCompose {
                    left: Box::new(inner),
                    right: Box::new(part),
                },
                position,
            );
        }

        Node::new(
            NodeKind::DoubleQuotedString {
                inner: Box::new(inner),
            },
            Position::new(start, self.pos),
        )
    }

    fn parse_dollar(&mut self) -> Node {
        let start = self.pos;
        self.advance();
        match self.peek() {
            Some(b'?') => {
                self.advance();
                Node::new(
                    NodeKind::SpecialVariable { name: '?' },
                    Position::new(start, self.pos),
                )
            }
            Some(b'$') => {
                self.advance();
                Node::new(
                    NodeKind::SpecialVariable { name: '$' },
                    Position::new(start, self.pos),
                )
            }
            Some(b'(') => {
                self.advance();
                let inner = self.parse_sequence();
                if !self.eat(b')') {
                    return self.syntax_error(start, "expected ')' to close command substitution");
                }
                let Some(inner) = inner else {
                    return self.syntax_error(start, "expected a command to substitute");
                };
                Node::new(
                    NodeKind::Execute {
                        command: Box::new(inner),
                        capture_stdout: true,
                    },
                    Position::new(start, self.pos),
                )
            }
            Some(b'{') => {
                self.advance();
                self.dynamic_depth += 1;
                let inner = self.parse_sequence();
                self.dynamic_depth -= 1;
                if !self.eat(b'}') {
                    return self.syntax_error(start, "expected '}' to close dynamic evaluation");
                }
                let Some(inner) = inner else {
                    return self.syntax_error(start, "expected an expression to evaluate");
                };
                Node::new(
                    NodeKind::DynamicEvaluate {
                        inner: Box::new(inner),
                    },
                    Position::new(start, self.pos),
                )
            }
            Some(c) if c.is_ascii_alphanumeric() || c == b'_' => {
                let name_start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
                    self.advance();
                }
                let name = self.text(Position::new(name_start, self.pos)).to_string();
                Node::new(
                    NodeKind::SimpleVariable { name },
                    Position::new(start, self.pos),
                )
            }
            _ => Node::new(
                NodeKind::BarewordLiteral {
                    text: "$".to_string(),
                },
                Position::new(start, self.pos),
            ),
        }
    }

    /// `(a b c)` builds a list literal.
    fn parse_list_literal(&mut self) -> Node {
        let start = self.pos;
        self.advance();
        let mut words = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return self.syntax_error(start, "expected ')' to close list"),
                Some(b')') => {
                    self.advance();
                    break;
                }
                _ => {
                    let Some(word) = self.parse_expression() else {
                        return self.syntax_error(start, "expected ')' to close list");
                    };
                    words.push(word);
                }
            }
        }
        let inner = fold_word_list(words).map(Box::new);
        Node::new(NodeKind::CastToList { inner }, Position::new(start, self.pos))
    }

    fn parse_tilde(&mut self) -> Node {
        let start = self.pos;
        self.advance();
        let name_start = self.pos;
        while matches!(
            self.peek(),
            Some(c) if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' || c == b'.'
        ) {
            self.advance();
        }
        let username = self.text(Position::new(name_start, self.pos)).to_string();
        Node::new(
            NodeKind::Tilde { username },
            Position::new(start, self.pos),
        )
    }

    fn parse_bareword(&mut self) -> Option<Node> {
        let start = self.pos;
        let mut text: Vec<u8> = Vec::new();
        let mut has_glob = false;
        loop {
            match self.peek() {
                None => break,
                Some(b'\\') => {
                    self.advance();
                    if let Some(escaped) = self.peek() {
                        text.push(escaped);
                        self.advance();
                    } else {
                        text.push(b'\\');
                    }
                }
                Some(b'\'') | Some(b'"') | Some(b'$') | Some(b'(') => break,
                Some(b'}') if self.dynamic_depth > 0 => break,
                Some(byte) => {
                    if self.at_word_boundary() {
                        break;
                    }
                    if byte == b'*' || byte == b'?' {
                        has_glob = true;
                    }
                    text.push(byte);
                    self.advance();
                }
            }
        }
        if text.is_empty() && self.pos == start {
            // An unexpected character; consume it so parsing always advances.
            self.advance();
            return Some(self.syntax_error(start, "unexpected character"));
        }
        let text = String::from_utf8_lossy(&text).into_owned();
        let position = Position::new(start, self.pos);
        Some(if has_glob {
            Node::new(NodeKind::Glob { text }, position)
        } else {
            Node::new(NodeKind::BarewordLiteral { text }, position)
        })
    }
}

enum RedirKind {
    Read,
    Write,
    WriteAppend,
    ReadWrite,
}

fn sequence(left: Node, right: Node) -> Node {
    let position = Position::new(left.position.start, right.position.end);
    Node::new(
        NodeKind::Sequence {
            left: Box::new(left),
            right: Box::new(right),
        },
        position,
    )
}

fn ensure_execute(node: Node) -> Box<Node> {
    if node.would_execute() {
        return Box::new(node);
    }
    let position = node.position;
    Box::new(Node::new(
        NodeKind::Execute {
            command: Box::new(node),
            capture_stdout: false,
        },
        position,
    ))
}

/// Folds space-separated words into a right-leaning `ListConcatenate`
/// chain; a single word stays bare.
fn fold_word_list(words: Vec<Node>) -> Option<Node> {
    let mut iter = words.into_iter().rev();
    let mut list = iter.next()?;
    for word in iter {
        let position = Position::new(word.position.start, list.position.end);
        list = Node::new(
            NodeKind::ListConcatenate {
                element: Box::new(word),
                list: Box::new(list),
            },
            position,
        );
    }
    Some(list)
}
