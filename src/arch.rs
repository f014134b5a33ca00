use std::fmt::Display;

/// Target architecture tag, e.g. `web.browser`, `web.browser.legacy`,
/// `web.cordova`, `os`, `os.linux.x86_64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Arch(String);

impl Arch {
    pub fn new(tag: impl Into<String>) -> Arch {
        Arch(tag.into())
    }

    pub fn tag(&self) -> &str {
        &self.0
    }

    // An arch matches a pattern when the pattern is a dot-separated
    // prefix of the tag: `os.linux.x86_64` matches `os` and `os.linux`
    // but not `os.li`.
    pub fn matches(&self, pattern: &str) -> bool {
        let tag = self.0.as_str();
        tag == pattern
            || (tag.starts_with(pattern) && tag.as_bytes().get(pattern.len()) == Some(&b'.'))
    }

    pub fn is_web(&self) -> bool {
        self.matches("web")
    }

    pub fn is_server(&self) -> bool {
        !self.is_web()
    }

    // Legacy web bundles avoid modern syntax in compiled output.
    pub fn is_legacy(&self) -> bool {
        self.matches("web.browser.legacy")
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Arch;

    #[test]
    fn prefix_matching() {
        let arch = Arch::new("os.linux.x86_64");
        assert!(arch.matches("os"));
        assert!(arch.matches("os.linux"));
        assert!(arch.matches("os.linux.x86_64"));
        assert!(!arch.matches("os.li"));
        assert!(!arch.matches("web"));
    }

    #[test]
    fn web_and_server() {
        assert!(Arch::new("web.browser").is_web());
        assert!(Arch::new("web.cordova").is_web());
        assert!(!Arch::new("web.browser").is_server());
        assert!(Arch::new("os").is_server());
        assert!(Arch::new("os.osx.arm64").is_server());
    }

    #[test]
    fn legacy() {
        assert!(Arch::new("web.browser.legacy").is_legacy());
        assert!(!Arch::new("web.browser").is_legacy());
        assert!(!Arch::new("os").is_legacy());
    }
}
