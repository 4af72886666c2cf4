/// The closed set of boolean shell options toggled by `setopt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Keep empty segments when IFS-splitting captured `$(...)` output.
    pub inline_exec_keep_empty_segments: bool,
    /// Echo each command before running it.
    pub verbose: bool,
}

impl Options {
    pub const NAMES: &'static [&'static str] = &["inline_exec_keep_empty_segments", "verbose"];

    pub fn get(&self, name: &str) -> Option<bool> {
        match name {
            "inline_exec_keep_empty_segments" => Some(self.inline_exec_keep_empty_segments),
            "verbose" => Some(self.verbose),
            _ => None,
        }
    }

    /// Returns false when the name is not a known option.
    pub fn set(&mut self, name: &str, value: bool) -> bool {
        match name {
            "inline_exec_keep_empty_segments" => self.inline_exec_keep_empty_segments = value,
            "verbose" => self.verbose = value,
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_listed_name_round_trips() {
        let mut options = Options::default();
        for name in Options::NAMES {
            assert!(options.set(name, true), "{name} should be settable");
            assert_eq!(options.get(name), Some(true));
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        let mut options = Options::default();
        assert!(!options.set("definitely_not_an_option", true));
        assert_eq!(options.get("definitely_not_an_option"), None);
    }
}
