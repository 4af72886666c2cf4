//! End-to-end tests driving real child processes through the session.
//!
//! Child reaping is process-global (`waitpid(-1)` while draining capture
//! pipes), so every test serializes on one lock.

use std::fs;
use std::sync::Mutex;

use conch::state::session::Session;

static LOCK: Mutex<()> = Mutex::new(());

fn with_session(test: impl FnOnce(&mut Session, &std::path::Path)) {
    let _guard = LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let scratch = tempfile::tempdir().unwrap();
    let mut session = Session::new().unwrap();
    test(&mut session, scratch.path());
}

fn read(path: &std::path::Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

#[test]
fn echo_writes_its_arguments() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!("echo hello world > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "hello world\n");
    });
}

#[test]
fn redirect_then_cat_round_trips() {
    with_session(|session, dir| {
        let file = dir.join("x");
        let out = dir.join("out");
        let code = session.run_command(&format!(
            "echo foo > {file} ; cat {file} > {out}",
            file = file.display(),
            out = out.display()
        ));
        assert_eq!(code, 0);
        assert_eq!(read(&file), "foo\n");
        assert_eq!(read(&out), "foo\n");
    });
}

#[test]
fn and_short_circuits_and_sequences_continue() {
    with_session(|session, dir| {
        let nope = dir.join("nope");
        let yes = dir.join("yes");
        let code = session.run_command(&format!(
            "false && echo nope > {} ; echo yes > {}",
            nope.display(),
            yes.display()
        ));
        assert_eq!(code, 0);
        assert!(!nope.exists());
        assert_eq!(read(&yes), "yes\n");
    });
}

#[test]
fn or_runs_the_right_side_on_failure() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!("false || echo ok > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "ok\n");
    });
}

#[test]
fn or_skips_the_right_side_on_success() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!("true || echo ok > {}", out.display()));
        assert_eq!(code, 0);
        assert!(!out.exists());
    });
}

#[test]
fn pipelines_connect_stdout_to_stdin() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!("echo a | tr a-z A-Z > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "A\n");
    });
}

#[test]
fn three_stage_pipelines_work() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!(
            "printf 'b\\na\\nb\\n' | sort | uniq > {}",
            out.display()
        ));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "a\nb\n");
    });
}

#[test]
fn variable_declarations_bind_left_to_right() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!("X=1 Y=$X ; echo $Y > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "1\n");
    });
}

#[test]
fn aliases_expand_without_rerunning_themselves() {
    with_session(|session, dir| {
        let out = dir.join("out");
        session.run_command("alias e='echo aliased'");
        let code = session.run_command(&format!("e extra > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "aliased extra\n");
    });
}

#[test]
fn tilde_expands_to_home() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!("echo ~ > {}", out.display()));
        assert_eq!(code, 0);
        let home = std::env::var("HOME").unwrap();
        assert_eq!(read(&out), format!("{home}\n"));
    });
}

#[test]
fn command_substitution_captures_stdout() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!("echo $(echo hi) > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "hi\n");
    });
}

#[test]
fn command_substitution_splits_on_newlines() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!("echo $(seq 1 5) > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "1 2 3 4 5\n");
    });
}

#[test]
fn large_substitutions_drain_past_one_chunk() {
    with_session(|session, dir| {
        let out = dir.join("out");
        // seq's output here is well past the 4096-byte read chunk.
        let code = session.run_command(&format!("echo $(seq 1 2000) > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out).split_whitespace().count(), 2000);
    });
}

#[test]
fn failing_commands_set_the_return_code() {
    with_session(|session, _dir| {
        assert_ne!(session.run_command("false"), 0);
        assert_eq!(session.last_return_code, 1);
        assert_eq!(session.run_command("true"), 0);
    });
}

#[test]
fn missing_commands_exit_127() {
    with_session(|session, _dir| {
        let code = session.run_command("definitely-not-a-real-command-xyz");
        assert_eq!(code, 127);
    });
}

#[test]
fn directories_are_not_executable() {
    with_session(|session, _dir| {
        let code = session.run_command("/tmp");
        assert_eq!(code, 126);
    });
}

#[test]
fn missing_left_side_short_circuits_and() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!(
            "definitely-not-a-real-command-xyz && echo no > {}",
            out.display()
        ));
        assert_eq!(code, 127);
        assert!(!out.exists());
    });
}

#[test]
fn kill_terminates_a_background_job() {
    with_session(|session, _dir| {
        session.run_command("sleep 5 &");
        let job = session.jobs.values().next().unwrap().clone();
        let pid = job.borrow().pid;

        session.run_command(&format!("kill -TERM {pid}"));
        session.run_command("wait");

        assert_eq!(job.borrow().exit_code, Some(128 + libc::SIGTERM));
        assert!(session.jobs.is_empty());
    });
}

#[test]
fn special_variable_reads_the_last_return_code() {
    with_session(|session, dir| {
        let out = dir.join("out");
        session.run_command("false");
        let code = session.run_command(&format!("echo $? > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "1\n");
    });
}

#[test]
fn append_redirections_append() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!(
            "echo a > {out} ; echo b >> {out}",
            out = out.display()
        ));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "a\nb\n");
    });
}

#[test]
fn stderr_redirections_capture_diagnostics() {
    with_session(|session, dir| {
        let out = dir.join("out");
        session.run_command(&format!("ls /missing-path-xyz 2> {}", out.display()));
        assert!(!read(&out).is_empty());
    });
}

#[test]
fn fd_to_fd_redirections_apply_in_order() {
    with_session(|session, dir| {
        let out = dir.join("out");
        // 2 goes to the file first, then 1 is pointed at 2.
        let code = session.run_command(&format!("echo oops 2> {} 1>&2", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "oops\n");
    });
}

#[test]
fn redirection_errors_skip_only_the_offending_command() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!(
            "cat < /missing-input-xyz ; echo after > {}",
            out.display()
        ));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "after\n");
    });
}

#[test]
fn empty_argv_rewirings_apply_in_process_without_forking() {
    with_session(|session, dir| {
        let target = dir.join("self-rewire");
        // fd 17 is rewired inside the shell process itself; no job appears.
        let code = session.run_command(&format!("17> {}", target.display()));
        assert_eq!(code, 0);
        assert!(target.exists());
        assert!(session.jobs.is_empty());
        unsafe {
            libc::close(17);
        }
    });
}

#[test]
fn globs_expand_in_the_working_directory() {
    with_session(|session, dir| {
        fs::write(dir.join("one.txt"), "").unwrap();
        fs::write(dir.join("two.txt"), "").unwrap();
        fs::write(dir.join("other.log"), "").unwrap();
        let out = dir.join("out");

        let original = session.cwd.clone();
        session.run_command(&format!("cd {}", dir.display()));
        let code = session.run_command(&format!("echo *.txt > {}", out.display()));
        session.set_cwd(&original).unwrap();

        assert_eq!(code, 0);
        assert_eq!(read(&out), "one.txt two.txt\n");
    });
}

#[test]
fn background_jobs_join_the_table_and_wait_collects_them() {
    with_session(|session, _dir| {
        session.run_command("sleep 0.2 &");
        assert_eq!(session.jobs.len(), 1);
        let job = session.jobs.values().next().unwrap().clone();
        assert!(job.borrow().running_in_background);
        assert_eq!(job.borrow().pgid, job.borrow().pid);

        session.run_command("wait");
        assert!(session.jobs.is_empty());
        assert_eq!(job.borrow().exit_code, Some(0));
    });
}

#[test]
fn juxtaposition_builds_string_products() {
    with_session(|session, dir| {
        let out = dir.join("out");
        let code = session.run_command(&format!("echo file.(a b) > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "file.a file.b\n");
    });
}

#[test]
fn double_quotes_keep_words_together() {
    with_session(|session, dir| {
        let out = dir.join("out");
        session.run_command("GREETING=hello");
        let code = session.run_command(&format!("echo \"$GREETING world\" > {}", out.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "hello world\n");
    });
}

#[test]
fn open_fds_are_balanced_across_commands() {
    fn open_fd_count() -> usize {
        fs::read_dir("/proc/self/fd").unwrap().count()
    }

    with_session(|session, dir| {
        let out = dir.join("out");
        // Warm up lazily-created descriptors before measuring.
        session.run_command("true");
        let before = open_fd_count();

        session.run_command(&format!("echo hi > {}", out.display()));
        session.run_command(&format!("echo a | tr a-z A-Z > {}", out.display()));
        session.run_command(&format!("echo $(echo nested) > {}", out.display()));
        session.run_command("cat < /missing-input-xyz");

        assert_eq!(open_fd_count(), before);
    });
}

#[test]
fn builtins_run_in_the_shell_process() {
    with_session(|session, dir| {
        let original = session.cwd.clone();
        let code = session.run_command(&format!("cd {}", dir.display()));
        assert_eq!(code, 0);
        assert_eq!(session.cwd, fs::canonicalize(dir).unwrap());
        assert!(session.jobs.is_empty());
        session.set_cwd(&original).unwrap();
    });
}

#[test]
fn source_runs_a_script_in_the_current_session() {
    with_session(|session, dir| {
        let script = dir.join("script.sh");
        let out = dir.join("out");
        fs::write(
            &script,
            format!("MESSAGE=sourced\necho $MESSAGE > {}\n", out.display()),
        )
        .unwrap();

        let code = session.run_command(&format!("source {}", script.display()));
        assert_eq!(code, 0);
        assert_eq!(read(&out), "sourced\n");
        assert_eq!(session.local_variable_or("MESSAGE", ""), "sourced");
    });
}
