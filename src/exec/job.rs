use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

/// Shared handle to a child pipeline. Both the session's job table and any
/// `Value::Job` produced by evaluation observe the same state.
pub type JobRef = Rc<RefCell<Job>>;

#[derive(Debug)]
pub struct Job {
    pub pid: libc::pid_t,
    pub pgid: libc::pid_t,
    pub cmd: String,
    pub job_id: u64,
    pub exit_code: Option<i32>,
    pub running_in_background: bool,
    pub suspended: bool,
    pub start: Instant,
}

impl Job {
    pub fn spawn(pid: libc::pid_t, pgid: libc::pid_t, cmd: String, job_id: u64) -> JobRef {
        Rc::new(RefCell::new(Job {
            pid,
            pgid,
            cmd,
            job_id,
            exit_code: None,
            running_in_background: false,
            suspended: false,
            start: Instant::now(),
        }))
    }

    pub fn exited(&self) -> bool {
        self.exit_code.is_some()
    }

    pub fn set_exited(&mut self, exit_code: i32) {
        self.exit_code = Some(exit_code);
        self.suspended = false;
    }

    pub fn state_name(&self) -> &'static str {
        if self.exited() {
            "Done"
        } else if self.suspended {
            "Suspended"
        } else {
            "Running"
        }
    }
}
