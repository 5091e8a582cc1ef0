use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostOs {
    Windows,
    Linux,
    Macos,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostOs::Windows
        } else if cfg!(target_os = "macos") {
            HostOs::Macos
        } else {
            HostOs::Linux
        }
    }
}

/// Quoting rules of the shell that will interpret a composed command line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShellDialect {
    #[default]
    Posix,
    Windows,
}

impl ShellDialect {
    pub fn for_host() -> Self {
        match HostOs::current() {
            HostOs::Windows => ShellDialect::Windows,
            HostOs::Linux | HostOs::Macos => ShellDialect::Posix,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShellDialect::Posix => "posix",
            ShellDialect::Windows => "windows",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_dialect_matches_target_family() {
        let dialect = ShellDialect::for_host();
        if cfg!(windows) {
            assert_eq!(dialect, ShellDialect::Windows);
        } else {
            assert_eq!(dialect, ShellDialect::Posix);
        }
    }
}
