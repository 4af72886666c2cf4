use std::cell::RefCell;
use std::process::exit;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use rustyline::error::ReadlineError;

use conch::exec::sys;
use conch::prompt;
use conch::readline::LineEditor;
use conch::state::session::Session;
use conch::value::Value;

#[derive(Parser)]
#[command(name = "conch", version, about = "An interactive command shell")]
struct Cli {
    /// Evaluate one command, then exit with its return code
    #[arg(short = 'c', value_name = "COMMAND")]
    command: Option<String>,

    /// Script to evaluate instead of entering interactive mode
    script: Option<String>,

    /// Arguments made available to the script as $1..$N
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let session = Session::new().context("failed to initialize the shell session")?;
    let session = Rc::new(RefCell::new(session));

    if let Some(command) = cli.command {
        let code = session.borrow_mut().run_command(&command);
        session.borrow_mut().stop_all_jobs();
        exit(code);
    }

    if let Some(script) = cli.script {
        let code = {
            let mut session = session.borrow_mut();
            session.set_local_variable("0", Value::string(script.clone()));
            for (index, argument) in cli.args.iter().enumerate() {
                session
                    .set_local_variable(&(index + 1).to_string(), Value::string(argument.clone()));
            }
            match session.run_file(&script) {
                Ok(code) => code,
                Err(error) => {
                    eprintln!("conch: {error}");
                    1
                }
            }
        };
        session.borrow_mut().stop_all_jobs();
        exit(code);
    }

    interactive(session)
}

fn interactive(session: Rc<RefCell<Session>>) -> ! {
    sys::install_interrupt_handler();
    {
        let mut session = session.borrow_mut();
        session.interactive = true;
        session.load_history();
    }

    let mut editor = match LineEditor::new(session.clone()) {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("conch: {error}");
            exit(1);
        }
    };

    loop {
        {
            // Reap finished background jobs and report them before the
            // prompt goes back up.
            let mut session = session.borrow_mut();
            session.reap_jobs();
            session.restore_stdin();
        }
        let prompt = prompt::generate(&session.borrow());

        match editor.read_line(&prompt) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                editor.remember(&line);
                let mut session = session.borrow_mut();
                session.add_history_entry(&line);
                session.run_command(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("conch: {error}");
                break;
            }
        }
    }

    let mut session = session.borrow_mut();
    session.stop_all_jobs();
    session.save_history();
    exit(session.last_return_code);
}
