//! Turns a logical [`Command`] into what a backend transport accepts.
//!
//! Argv is used wherever the transport allows it. When a shell is unavoidable
//! every dynamic piece is quoted for the dialect of the shell that will read
//! the line, and input that quoting cannot neutralize is refused.

use std::collections::BTreeMap;

use contour_types::{BackendKind, Command, CommandConstruction, ExecutableForm, ShellDialect};

use crate::error::{ContourError, Result};

/// How a driver's transport consumes commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPolicy {
    /// Direct process spawn. Raw shell lines are refused.
    ArgvOnly,
    /// A shell of a known dialect reads one composed line.
    QuotedShell(ShellDialect),
    /// A minimal fixed shell with unknown quoting rules: tokens are
    /// allow-listed instead of quoted.
    AllowListedShell,
}

impl CommandPolicy {
    pub fn for_kind(kind: BackendKind, remote_dialect: ShellDialect) -> Self {
        match kind {
            BackendKind::Local => CommandPolicy::ArgvOnly,
            BackendKind::RemoteShell => CommandPolicy::QuotedShell(remote_dialect),
            BackendKind::Device => CommandPolicy::AllowListedShell,
        }
    }

    pub fn construction(self) -> CommandConstruction {
        match self {
            CommandPolicy::ArgvOnly => CommandConstruction::Argv,
            CommandPolicy::QuotedShell(_) => CommandConstruction::QuotedShellString,
            CommandPolicy::AllowListedShell => CommandConstruction::AllowListedShellLine,
        }
    }

    pub fn accepts_raw_shell_line(self) -> bool {
        !matches!(self, CommandPolicy::ArgvOnly)
    }

    pub fn dialect(self) -> Option<ShellDialect> {
        match self {
            CommandPolicy::ArgvOnly => None,
            CommandPolicy::QuotedShell(dialect) => Some(dialect),
            CommandPolicy::AllowListedShell => Some(ShellDialect::Posix),
        }
    }
}

pub fn build(command: &Command, policy: CommandPolicy) -> Result<ExecutableForm> {
    reject_nul(command)?;
    if command.raw_shell_line.is_some() && (!command.program.is_empty() || !command.arguments.is_empty()) {
        return Err(ContourError::UnsafeCommand(
            "command carries both argv and a raw shell line".to_string(),
        ));
    }

    match (policy, command.raw_shell_line.as_deref()) {
        (CommandPolicy::ArgvOnly, Some(_)) => Err(ContourError::UnsafeCommand(
            "this backend accepts argv only; raw shell lines are refused".to_string(),
        )),
        (CommandPolicy::ArgvOnly, None) => {
            require_program(command)?;
            for key in command.environment.keys() {
                validate_env_key(key)?;
            }
            Ok(ExecutableForm::Argv {
                argv: command.argv(),
                working_directory: command.working_directory.clone(),
                environment: command.environment.clone(),
            })
        }
        (CommandPolicy::QuotedShell(dialect), raw) => {
            let line = match dialect {
                ShellDialect::Posix => compose_posix(command, raw)?,
                ShellDialect::Windows => compose_windows(command, raw)?,
            };
            Ok(ExecutableForm::ShellLine { line, dialect })
        }
        (CommandPolicy::AllowListedShell, raw) => Ok(ExecutableForm::ShellLine {
            line: compose_device(command, raw)?,
            dialect: ShellDialect::Posix,
        }),
    }
}

fn reject_nul(command: &Command) -> Result<()> {
    let mut parts = vec![("program", command.program.as_str())];
    parts.extend(command.arguments.iter().map(|a| ("argument", a.as_str())));
    if let Some(dir) = &command.working_directory {
        parts.push(("working directory", dir.as_str()));
    }
    for (key, value) in &command.environment {
        parts.push(("environment key", key.as_str()));
        parts.push(("environment value", value.as_str()));
    }
    if let Some(line) = &command.raw_shell_line {
        parts.push(("raw shell line", line.as_str()));
    }
    match parts.into_iter().find(|(_, text)| text.contains('\0')) {
        Some((what, _)) => Err(ContourError::UnsafeCommand(format!("NUL byte in {what}"))),
        None => Ok(()),
    }
}

fn require_program(command: &Command) -> Result<()> {
    if command.program.trim().is_empty() {
        return Err(ContourError::UnsafeCommand("empty program".to_string()));
    }
    Ok(())
}

fn validate_env_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ContourError::UnsafeCommand(format!(
            "environment key {key:?} is not a valid variable name"
        )))
    }
}

/// Wraps `value` in single quotes for a POSIX shell.
pub fn quote_posix(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Quotes `value` as one argument for `cmd.exe` plus the MSVC argv parser.
/// Characters `cmd.exe` expands or splits on even inside quotes are refused.
pub fn quote_windows(value: &str) -> Result<String> {
    if let Some(bad) = value.chars().find(|c| matches!(c, '"' | '%' | '!' | '\r' | '\n')) {
        return Err(ContourError::UnsafeCommand(format!(
            "{bad:?} cannot be quoted safely for cmd.exe"
        )));
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    let mut backslashes = 0usize;
    for c in value.chars() {
        if c == '\\' {
            backslashes += 1;
        } else {
            backslashes = 0;
        }
        out.push(c);
    }
    // A run of backslashes before the closing quote must be doubled.
    out.extend(std::iter::repeat('\\').take(backslashes));
    out.push('"');
    Ok(out)
}

fn check_balanced_posix(line: &str) -> Result<()> {
    shell_words::split(line)
        .map(|_| ())
        .map_err(|err| ContourError::UnsafeCommand(format!("raw shell line: {err}")))
}

fn check_balanced_windows(line: &str) -> Result<()> {
    if line.chars().filter(|c| *c == '"').count() % 2 != 0 {
        return Err(ContourError::UnsafeCommand(
            "raw shell line has an unterminated quote".to_string(),
        ));
    }
    Ok(())
}

fn compose_posix(command: &Command, raw: Option<&str>) -> Result<String> {
    let mut segments = Vec::new();
    if let Some(dir) = &command.working_directory {
        segments.push(format!("cd -- {}", quote_posix(dir)));
    }
    let assignments = posix_assignments(&command.environment)?;
    match raw {
        Some(line) => {
            check_balanced_posix(line)?;
            if !assignments.is_empty() {
                segments.push(format!("export {}", assignments.join(" ")));
            }
            segments.push(line.to_string());
        }
        None => {
            require_program(command)?;
            let mut words = assignments;
            words.extend(command.argv().iter().map(|part| quote_posix(part)));
            segments.push(words.join(" "));
        }
    }
    Ok(segments.join(" && "))
}

fn posix_assignments(environment: &BTreeMap<String, String>) -> Result<Vec<String>> {
    environment
        .iter()
        .map(|(key, value)| {
            validate_env_key(key)?;
            Ok(format!("{key}={}", quote_posix(value)))
        })
        .collect()
}

fn compose_windows(command: &Command, raw: Option<&str>) -> Result<String> {
    let mut segments = Vec::new();
    if let Some(dir) = &command.working_directory {
        segments.push(format!("cd /d {}", quote_windows(dir)?));
    }
    for (key, value) in &command.environment {
        validate_env_key(key)?;
        segments.push(format!("set {}", quote_windows(&format!("{key}={value}"))?));
    }
    match raw {
        Some(line) => {
            check_balanced_windows(line)?;
            segments.push(line.to_string());
        }
        None => {
            require_program(command)?;
            let words = command
                .argv()
                .iter()
                .map(|part| quote_windows(part))
                .collect::<Result<Vec<_>>>()?;
            segments.push(words.join(" "));
        }
    }
    Ok(segments.join(" && "))
}

/// Accepts `token` only when it consists of `[A-Za-z0-9._/-]`.
pub fn validate_device_token(token: &str) -> Result<&str> {
    if token.is_empty() {
        return Err(ContourError::UnsafePath("empty token".to_string()));
    }
    if let Some(bad) = token
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')))
    {
        return Err(ContourError::UnsafePath(format!(
            "{token:?} contains {bad:?}, which the device shell does not allow"
        )));
    }
    Ok(token)
}

fn compose_device(command: &Command, raw: Option<&str>) -> Result<String> {
    if !command.environment.is_empty() {
        return Err(ContourError::UnsafeCommand(
            "device commands cannot carry environment assignments".to_string(),
        ));
    }
    let mut segments = Vec::new();
    if let Some(dir) = &command.working_directory {
        segments.push(format!("cd {}", validate_device_token(dir)?));
    }
    let words = match raw {
        Some(line) => {
            let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
            if tokens.is_empty() {
                return Err(ContourError::UnsafeCommand("empty shell line".to_string()));
            }
            tokens
                .into_iter()
                .map(validate_device_token)
                .collect::<Result<Vec<_>>>()?
        }
        None => {
            require_program(command)?;
            let mut words = vec![validate_device_token(&command.program)?];
            for arg in &command.arguments {
                words.push(validate_device_token(arg)?);
            }
            words
        }
    };
    segments.push(words.join(" "));
    Ok(segments.join(" && "))
}
