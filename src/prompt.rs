use std::env;

use colored::Colorize;

use crate::state::session::Session;

/// Builds the prompt string, honoring a `$PROMPT` format string when one is
/// set. Recognized escapes: `\X` (OSC 0 title opener), `\a` (BEL), `\e`
/// (ESC), `\u` (username), `\h` (hostname), `\w` (cwd with `$HOME` folded
/// to `~`), `\p` (`#` for root, `$` otherwise).
pub fn generate(session: &Session) -> String {
    match env::var("PROMPT") {
        Ok(format) => expand_format(&format, session),
        Err(_) => default_prompt(session),
    }
}

fn default_prompt(session: &Session) -> String {
    if session.uid == 0 {
        return "# ".to_string();
    }

    let cwd = folded_cwd(session);
    let mut prompt = format!(
        "\x1b]0;{}@{}:{}\x07",
        session.username, session.hostname, cwd
    );
    prompt.push_str(&format!(
        "{}@{}:{}$> ",
        session.username.red().bold(),
        session.hostname.white().bold(),
        cwd.green().bold()
    ));
    prompt
}

fn folded_cwd(session: &Session) -> String {
    let cwd = session.cwd_string();
    let home = session.home.to_string_lossy();
    match cwd.strip_prefix(home.as_ref()) {
        Some(rest) => format!("~{rest}"),
        None => cwd,
    }
}

fn expand_format(format: &str, session: &Session) -> String {
    let mut prompt = String::with_capacity(format.len());
    let mut characters = format.chars();
    while let Some(character) = characters.next() {
        if character != '\\' {
            prompt.push(character);
            continue;
        }
        let Some(escape) = characters.next() else {
            break;
        };
        match escape {
            'X' => prompt.push_str("\x1b]0;"),
            'a' => prompt.push('\x07'),
            'e' => prompt.push('\x1b'),
            'u' => prompt.push_str(&session.username),
            'h' => prompt.push_str(&session.hostname),
            'w' => prompt.push_str(&folded_cwd(session)),
            'p' => prompt.push(if session.uid == 0 { '#' } else { '$' }),
            _ => {}
        }
    }
    prompt
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prompt_format_escapes_expand() {
        let session = Session::new().unwrap();
        env::set_var("PROMPT", r"\u@\h\p ");
        let prompt = generate(&session);
        env::remove_var("PROMPT");

        assert!(prompt.contains(&session.username));
        assert!(prompt.contains(&session.hostname));
        assert!(prompt.ends_with("$ ") || prompt.ends_with("# "));
    }

    #[test]
    fn unknown_escapes_vanish() {
        let session = Session::new().unwrap();
        assert_eq!(expand_format(r"a\zb", &session), "ab");
    }

    #[test]
    fn home_folds_to_tilde() {
        let mut session = Session::new().unwrap();
        session.cwd = session.home.join("projects");
        assert_eq!(expand_format(r"\w", &session), "~/projects");
    }
}
