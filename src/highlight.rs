use std::fmt::Write as _;
use std::path::Path;

use crate::ast::{Node, NodeKind};
use crate::expand;
use crate::parser;
use crate::state::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Green,
    Yellow,
    Cyan,
    Rgb(u8, u8, u8),
}

impl Color {
    fn sgr(&self, out: &mut String) {
        match self {
            Color::Red => out.push_str("\x1b[31m"),
            Color::Green => out.push_str("\x1b[32m"),
            Color::Yellow => out.push_str("\x1b[33m"),
            Color::Cyan => out.push_str("\x1b[36m"),
            Color::Rgb(r, g, b) => {
                let _ = write!(out, "\x1b[38;2;{r};{g};{b}m");
            }
        }
    }
}

const VARIABLE_COLOR: Color = Color::Rgb(214, 112, 214);
const REDIRECTION_COLOR: Color = Color::Rgb(0x87, 0x9b, 0xcd);
const AMBER: Color = Color::Rgb(255, 126, 0);
const COMMENT_COLOR: Color = Color::Rgb(150, 150, 150);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Style {
    fg: Option<Color>,
    bold: bool,
    hyperlink: Option<String>,
}

#[derive(Debug)]
struct StyledSpan {
    start: usize,
    end: usize,
    style: Style,
}

/// The sink styled spans are written into while walking the tree; the
/// traversal never touches the terminal itself.
#[derive(Debug, Default)]
struct SpanSink {
    spans: Vec<StyledSpan>,
}

impl SpanSink {
    fn color(&mut self, start: usize, end: usize, fg: Color) {
        self.spans.push(StyledSpan {
            start,
            end,
            style: Style {
                fg: Some(fg),
                ..Style::default()
            },
        });
    }

    fn styled(&mut self, start: usize, end: usize, fg: Option<Color>, bold: bool) {
        self.spans.push(StyledSpan {
            start,
            end,
            style: Style {
                fg,
                bold,
                hyperlink: None,
            },
        });
    }

    fn hyperlink(&mut self, start: usize, end: usize, url: String) {
        self.spans.push(StyledSpan {
            start,
            end,
            style: Style {
                fg: None,
                bold: false,
                hyperlink: Some(url),
            },
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct Metadata {
    is_first_in_list: bool,
}

/// Highlights a whole line: parse, walk the tree collecting styled spans,
/// then render them as ANSI text. Unparseable input comes back unstyled.
pub fn highlight_line(session: &Session, line: &str) -> String {
    let Some(ast) = parser::parse(line) else {
        return line.to_string();
    };
    let mut sink = SpanSink::default();
    collect(
        &ast,
        session,
        &mut sink,
        Metadata {
            is_first_in_list: true,
        },
    );
    render(line, &sink.spans)
}

fn file_url(session: &Session, path: &str) -> String {
    let resolved = session.resolve_path(path);
    format!("file://{}{}", session.hostname, resolved)
}

fn collect(node: &Node, session: &Session, sink: &mut SpanSink, mut metadata: Metadata) {
    let start = node.position.start;
    let end = node.position.end;

    match &node.kind {
        NodeKind::BarewordLiteral { text } => {
            if metadata.is_first_in_list {
                sink.styled(start, end, None, true);
                return;
            }
            if text.starts_with('-') {
                if text == "--" {
                    sink.color(start, end, Color::Green);
                    return;
                }
                if text == "-" {
                    return;
                }
                if text.starts_with("--") {
                    // Only the `--name` part of `--name=value` is an option.
                    let option_len = text.find('=').map(|index| index + 1).unwrap_or(text.len());
                    sink.color(start, start + option_len, Color::Cyan);
                } else {
                    sink.color(start, end, Color::Cyan);
                }
            }
            if Path::new(text).exists() {
                sink.hyperlink(start, end, file_url(session, text));
            }
        }

        NodeKind::StringLiteral { .. } => {
            sink.styled(start, end, Some(Color::Yellow), metadata.is_first_in_list);
        }

        NodeKind::Glob { .. } => {
            sink.styled(start, end, Some(Color::Cyan), metadata.is_first_in_list);
        }

        NodeKind::SimpleVariable { .. } => {
            sink.styled(start, end, Some(VARIABLE_COLOR), metadata.is_first_in_list);
        }

        NodeKind::SpecialVariable { .. } => {
            sink.color(start, end, VARIABLE_COLOR);
        }

        NodeKind::Comment { .. } => {
            sink.color(start, end, COMMENT_COLOR);
        }

        NodeKind::SyntaxError { .. } => {
            sink.styled(start, end, Some(Color::Red), true);
        }

        NodeKind::DoubleQuotedString { inner } => {
            sink.styled(start, end, Some(Color::Yellow), metadata.is_first_in_list);
            metadata.is_first_in_list = false;
            collect(inner, session, sink, metadata);
        }

        NodeKind::DynamicEvaluate { inner } => {
            sink.color(start, end, Color::Yellow);
            collect(inner, session, sink, metadata);
        }

        NodeKind::Execute {
            command,
            capture_stdout,
        } => {
            if *capture_stdout {
                sink.color(start, end, Color::Green);
            }
            metadata.is_first_in_list = true;
            collect(command, session, sink, metadata);
        }

        NodeKind::And { left, right } => {
            metadata.is_first_in_list = true;
            collect(left, session, sink, metadata);
            collect(right, session, sink, metadata);
        }

        NodeKind::Or { left, right }
        | NodeKind::Pipe { left, right }
        | NodeKind::Sequence { left, right }
        | NodeKind::StringPartCompose { left, right } => {
            collect(left, session, sink, metadata);
            collect(right, session, sink, metadata);
        }

        NodeKind::Join { left, right } => {
            collect(left, session, sink, metadata);
            if left.is_list() || left.is_command() {
                metadata.is_first_in_list = false;
            }
            collect(right, session, sink, metadata);
        }

        NodeKind::ListConcatenate { element, list } => {
            let first = metadata.is_first_in_list;
            metadata.is_first_in_list = false;
            collect(list, session, sink, metadata);
            metadata.is_first_in_list = first;
            collect(element, session, sink, metadata);
        }

        NodeKind::Juxtaposition { left, right } => {
            collect(left, session, sink, metadata);
            // `~/foo/bar` resolves the tilde so the whole word can carry a
            // file hyperlink; tilde resolution is a pure lookup.
            if left.is_tilde() && right.is_bareword() {
                if let (NodeKind::Tilde { username }, NodeKind::BarewordLiteral { text }) =
                    (&left.kind, &right.kind)
                {
                    let path = format!("{}{}", expand::expand_tilde(&format!("~{username}")), text);
                    if Path::new(&path).exists() {
                        sink.hyperlink(start, end, file_url(session, &path));
                    }
                    return;
                }
            }
            collect(right, session, sink, metadata);
        }

        NodeKind::Background { command } => {
            collect(command, session, sink, metadata);
        }

        NodeKind::CastToCommand { inner } => {
            collect(inner, session, sink, metadata);
        }

        NodeKind::CastToList { inner } => {
            if let Some(inner) = inner {
                collect(inner, session, sink, metadata);
            }
        }

        NodeKind::ReadRedirection { path, .. }
        | NodeKind::WriteRedirection { path, .. }
        | NodeKind::WriteAppendRedirection { path, .. }
        | NodeKind::ReadWriteRedirection { path, .. } => {
            sink.color(start, end, REDIRECTION_COLOR);
            metadata.is_first_in_list = false;
            collect(path, session, sink, metadata);
            if let NodeKind::BarewordLiteral { text } = &path.kind {
                let resolved = if text.starts_with('/') {
                    text.clone()
                } else {
                    format!("{}/{}", session.cwd_string(), text)
                };
                if Path::new(&resolved).exists() {
                    sink.hyperlink(path.position.start, path.position.end, file_url(session, &resolved));
                }
            }
        }

        NodeKind::CloseFdRedirection { .. } => {
            sink.color(start, end.saturating_sub(1), REDIRECTION_COLOR);
            sink.color(end.saturating_sub(1), end, AMBER);
        }

        NodeKind::Fd2FdRedirection { .. } => {
            sink.color(start, end, REDIRECTION_COLOR);
        }

        NodeKind::VariableDeclarations { variables } => {
            metadata.is_first_in_list = false;
            for decl in variables {
                collect(&decl.name, session, sink, metadata);
                // The '=' sits at the end of the name's span.
                sink.color(
                    decl.name.position.end.saturating_sub(1),
                    decl.name.position.end,
                    Color::Cyan,
                );
                collect(&decl.value, session, sink, metadata);
            }
        }

        NodeKind::Tilde { .. } | NodeKind::CommandLiteral { .. } => {}
    }
}

/// Flattens the span list into ANSI CSI text. Later spans override earlier
/// ones per attribute; bold accumulates. Hyperlinks render as OSC 8 pairs.
fn render(line: &str, spans: &[StyledSpan]) -> String {
    let chars: Vec<(usize, char)> = line.char_indices().collect();
    let mut styles = vec![Style::default(); chars.len()];

    for span in spans {
        for (slot, (byte_index, _)) in chars.iter().enumerate() {
            if span.start <= *byte_index && *byte_index < span.end {
                let style = &mut styles[slot];
                if span.style.fg.is_some() {
                    style.fg = span.style.fg;
                }
                style.bold |= span.style.bold;
                if span.style.hyperlink.is_some() {
                    style.hyperlink = span.style.hyperlink.clone();
                }
            }
        }
    }

    let mut out = String::with_capacity(line.len());
    let mut active = Style::default();
    for (slot, (_, character)) in chars.iter().enumerate() {
        let style = &styles[slot];
        if *style != active {
            if active.hyperlink != style.hyperlink {
                if active.hyperlink.is_some() {
                    out.push_str("\x1b]8;;\x1b\\");
                }
                if let Some(url) = &style.hyperlink {
                    let _ = write!(out, "\x1b]8;;{url}\x1b\\");
                }
            }
            out.push_str("\x1b[0m");
            if style.bold {
                out.push_str("\x1b[1m");
            }
            if let Some(color) = &style.fg {
                color.sgr(&mut out);
            }
            active = style.clone();
        }
        out.push(*character);
    }
    if active != Style::default() {
        out.push_str("\x1b[0m");
        if active.hyperlink.is_some() {
            out.push_str("\x1b]8;;\x1b\\");
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_session() -> Session {
        Session::new().unwrap()
    }

    #[test]
    fn first_word_is_bold() {
        let session = test_session();
        let highlighted = highlight_line(&session, "makeup --flag");
        assert!(highlighted.starts_with("\x1b[0m\x1b[1m"));
    }

    #[test]
    fn flags_are_cyan() {
        let session = test_session();
        let highlighted = highlight_line(&session, "grep --color auto");
        assert!(highlighted.contains("\x1b[36m"));
    }

    #[test]
    fn strings_are_yellow() {
        let session = test_session();
        let highlighted = highlight_line(&session, "echo 'hello'");
        assert!(highlighted.contains("\x1b[33m"));
    }

    #[test]
    fn variables_use_the_variable_color() {
        let session = test_session();
        let highlighted = highlight_line(&session, "echo $name");
        assert!(highlighted.contains("\x1b[38;2;214;112;214m"));
    }

    #[test]
    fn syntax_errors_are_red() {
        let session = test_session();
        let highlighted = highlight_line(&session, "echo 'broken");
        assert!(highlighted.contains("\x1b[31m"));
    }

    #[test]
    fn existing_paths_get_file_hyperlinks() {
        let session = test_session();
        let highlighted = highlight_line(&session, "ls /tmp");
        assert!(highlighted.contains("\x1b]8;;file://"));
        assert!(highlighted.contains(&session.hostname));
    }

    #[test]
    fn unparseable_lines_pass_through() {
        let session = test_session();
        assert_eq!(highlight_line(&session, ""), "");
    }

    #[test]
    fn comments_are_gray() {
        let session = test_session();
        let highlighted = highlight_line(&session, "echo hi # note");
        assert!(highlighted.contains("\x1b[38;2;150;150;150m"));
    }
}
