use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::runtime::ShellDialect;

/// A logical command to run on a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Command {
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Pre-composed shell text. Only honored by drivers that talk to a shell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_shell_line: Option<String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn shell_line(line: impl Into<String>) -> Self {
        Self {
            raw_shell_line: Some(line.into()),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + self.arguments.len());
        argv.push(self.program.clone());
        argv.extend(self.arguments.iter().cloned());
        argv
    }
}

/// What a driver actually hands to its backend for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum ExecutableForm {
    Argv {
        argv: Vec<String>,
        working_directory: Option<String>,
        environment: BTreeMap<String, String>,
    },
    ShellLine {
        line: String,
        dialect: ShellDialect,
    },
}

impl ExecutableForm {
    pub fn is_argv(&self) -> bool {
        matches!(self, ExecutableForm::Argv { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    RemoteShell,
    Device,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::RemoteShell => "remote_shell",
            BackendKind::Device => "device",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalParams {
    /// Command that launches the protocol-speaking backend process.
    pub launch: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteShellParams {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    /// Shell family of the remote login shell.
    #[serde(default)]
    pub dialect: ShellDialect,
    /// Command that launches the backend on the remote host.
    pub launch: Command,
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

impl RemoteShellParams {
    pub fn new(host: impl Into<String>, launch: Command) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            dialect: ShellDialect::Posix,
            launch,
            ssh_program: default_ssh_program(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Character device node of the serial-like link, e.g. `/dev/ttyACM0`.
    pub device_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionParameters {
    Local(LocalParams),
    RemoteShell(RemoteShellParams),
    Device(DeviceParams),
}

/// Which backend to start and how to reach it. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendDescriptor {
    params: ConnectionParameters,
}

impl BackendDescriptor {
    pub fn local(launch: Command) -> Self {
        Self {
            params: ConnectionParameters::Local(LocalParams { launch }),
        }
    }

    pub fn remote_shell(params: RemoteShellParams) -> Self {
        Self {
            params: ConnectionParameters::RemoteShell(params),
        }
    }

    pub fn device(device_path: impl Into<String>) -> Self {
        Self {
            params: ConnectionParameters::Device(DeviceParams {
                device_path: device_path.into(),
            }),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self.params {
            ConnectionParameters::Local(_) => BackendKind::Local,
            ConnectionParameters::RemoteShell(_) => BackendKind::RemoteShell,
            ConnectionParameters::Device(_) => BackendKind::Device,
        }
    }

    pub fn connection_parameters(&self) -> &ConnectionParameters {
        &self.params
    }
}

/// How a driver turns a [`Command`] into something its transport accepts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandConstruction {
    Argv,
    QuotedShellString,
    AllowListedShellLine,
    TrustedEscapeHatch,
}

/// Audit record describing what a backend transport does and does not protect.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TrustBoundary {
    pub label: &'static str,
    pub transport_authenticated: bool,
    pub transport_encrypted: bool,
    pub construction: CommandConstruction,
    pub backend_output_trusted: bool,
    pub notes: &'static str,
}
