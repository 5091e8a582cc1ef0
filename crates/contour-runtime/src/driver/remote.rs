use std::collections::BTreeMap;

use contour_core::{build, CommandPolicy, ContourError, ProtocolConfig, Result};
use contour_types::{CommandConstruction, ExecutableForm, RemoteShellParams, TrustBoundary};

use super::process::spawn_piped;
use super::BackendLink;

/// Backend reached through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct RemoteShellDriver {
    params: RemoteShellParams,
}

impl RemoteShellDriver {
    pub fn new(params: RemoteShellParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RemoteShellParams {
        &self.params
    }

    pub fn policy(&self) -> CommandPolicy {
        CommandPolicy::QuotedShell(self.params.dialect)
    }

    /// Arguments passed to the ssh client. The remote command is the last
    /// element and is already quoted for the remote shell.
    pub fn ssh_args(&self) -> Result<Vec<String>> {
        let params = &self.params;
        validate_ssh_field("host", &params.host)?;
        if let Some(user) = &params.user {
            validate_ssh_field("user", user)?;
            if user.contains('@') {
                return Err(ContourError::UnsafeCommand(
                    "ssh user must not contain '@'".to_string(),
                ));
            }
        }
        if let Some(identity) = &params.identity_file {
            validate_ssh_field("identity file", identity)?;
        }

        let ExecutableForm::ShellLine { line, .. } = build(&params.launch, self.policy())? else {
            return Err(ContourError::UnsafeCommand(
                "remote launch must compose to a shell line".to_string(),
            ));
        };

        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(port) = params.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &params.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        let target = match &params.user {
            Some(user) => format!("{}@{}", user, params.host),
            None => params.host.clone(),
        };
        args.push("--".to_string());
        args.push(target);
        args.push(line);
        Ok(args)
    }

    pub(crate) async fn start(&self, protocol: &ProtocolConfig) -> Result<BackendLink> {
        let args = self.ssh_args()?;
        validate_ssh_field("ssh program", &self.params.ssh_program)?;
        tracing::info!(
            "Opening remote shell to {} ({})",
            self.params.host,
            self.params.dialect.as_str()
        );
        spawn_piped(
            &self.params.ssh_program,
            &args,
            None,
            &BTreeMap::new(),
            protocol,
        )
    }

    pub fn trust_boundary() -> TrustBoundary {
        TrustBoundary {
            label: "secure remote shell",
            transport_authenticated: true,
            transport_encrypted: true,
            construction: CommandConstruction::QuotedShellString,
            backend_output_trusted: false,
            notes: "ssh authenticates and encrypts the channel. The remote login shell reads one \
                    composed line, so every dynamic piece is quoted for the remote dialect and \
                    input quoting cannot neutralize is refused.",
        }
    }
}

/// Stops values from being read as ssh options or splitting into extra words.
fn validate_ssh_field(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ContourError::UnsafeCommand(format!("ssh {field} is empty")));
    }
    if value.starts_with('-') {
        return Err(ContourError::UnsafeCommand(format!(
            "ssh {field} must not start with '-'"
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ContourError::UnsafeCommand(format!(
            "ssh {field} contains whitespace or control characters"
        )));
    }
    Ok(())
}
