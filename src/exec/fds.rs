use std::os::unix::io::RawFd;

use super::sys;

/// Scoped owner of the transient fds the parent holds while setting up a
/// command: opened redirection targets and parent-side pipe ends.
///
/// Every collected fd is closed exactly once, either explicitly after the
/// child has `dup2`'d its own copies, or on drop when command setup bails
/// out partway through.
#[derive(Default)]
pub struct FdCollector {
    fds: Vec<RawFd>,
}

impl FdCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fd: RawFd) {
        self.fds.push(fd);
    }

    /// Closes everything collected so far.
    pub fn collect(&mut self) {
        for fd in self.fds.drain(..) {
            sys::close(fd);
        }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

impl Drop for FdCollector {
    fn drop(&mut self) {
        self.collect();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd")
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn collector_closes_on_drop() {
        let before = open_fd_count();
        {
            let (read_fd, write_fd) = sys::pipe().unwrap();
            let mut fds = FdCollector::new();
            fds.add(read_fd);
            fds.add(write_fd);
            assert_eq!(fds.len(), 2);
        }
        assert_eq!(open_fd_count(), before);
    }

    #[test]
    fn explicit_collect_is_idempotent() {
        let (read_fd, write_fd) = sys::pipe().unwrap();
        let mut fds = FdCollector::new();
        fds.add(read_fd);
        fds.add(write_fd);
        fds.collect();
        assert!(fds.is_empty());
        fds.collect();
    }
}
