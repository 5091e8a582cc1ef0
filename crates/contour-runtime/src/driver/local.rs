use contour_core::{build, CommandPolicy, ContourError, ProtocolConfig, Result};
use contour_types::{Command, CommandConstruction, ExecutableForm, TrustBoundary};

use super::process::spawn_piped;
use super::BackendLink;

/// Backend running as a child process of the IDE.
#[derive(Debug, Clone)]
pub struct LocalDriver {
    launch: Command,
}

impl LocalDriver {
    pub fn new(launch: Command) -> Self {
        Self { launch }
    }

    pub fn launch(&self) -> &Command {
        &self.launch
    }

    pub(crate) async fn start(&self, protocol: &ProtocolConfig) -> Result<BackendLink> {
        let ExecutableForm::Argv {
            argv,
            working_directory,
            environment,
        } = build(&self.launch, CommandPolicy::ArgvOnly)?
        else {
            return Err(ContourError::UnsafeCommand(
                "local backends are launched from an argv vector".to_string(),
            ));
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(ContourError::BackendUnavailable(
                "launch command has no program".to_string(),
            ));
        };
        spawn_piped(
            program,
            args,
            working_directory.as_deref(),
            &environment,
            protocol,
        )
    }

    pub fn trust_boundary() -> TrustBoundary {
        TrustBoundary {
            label: "local process",
            transport_authenticated: true,
            transport_encrypted: false,
            construction: CommandConstruction::Argv,
            backend_output_trusted: false,
            notes: "Pipes to a child of the IDE process. Commands travel as argv vectors and are \
                    never interpreted by a shell. Output is produced by user code and decoded \
                    as literal data only.",
        }
    }
}
