//! Per-kind strategies for reaching a backend.
//!
//! Each variant owns its quoting and trust policy, so sessions and the
//! supervisor stay backend-agnostic.

mod device;
mod local;
mod process;
mod remote;

pub use device::{DeviceDriver, DeviceStream};
pub use local::LocalDriver;
pub use process::BackendProcess;
pub use remote::RemoteShellDriver;

use contour_core::{CommandPolicy, ProtocolConfig, Result};
use contour_types::{
    BackendDescriptor, BackendKind, CommandConstruction, ConnectionParameters, ShellDialect,
    TrustBoundary,
};
use std::process::ExitStatus;
use std::time::Duration;

use serde::Serialize;
use tokio::process::ChildStderr;

use crate::transport::{Channel, FrameSender};

/// An established transport, ready for the handshake.
pub struct BackendLink {
    pub channel: Channel,
    pub process: Option<BackendProcess>,
    /// Out-of-protocol diagnostics, when the transport has a side channel.
    pub stderr: Option<ChildStderr>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DriverCapabilities {
    pub kind: BackendKind,
    pub construction: CommandConstruction,
    pub accepts_raw_shell_line: bool,
    pub dialect: Option<ShellDialect>,
    pub has_process: bool,
}

#[derive(Debug)]
pub enum Driver {
    Local(LocalDriver),
    RemoteShell(RemoteShellDriver),
    Device(DeviceDriver),
}

impl Driver {
    pub fn for_descriptor(descriptor: &BackendDescriptor) -> Self {
        match descriptor.connection_parameters() {
            ConnectionParameters::Local(params) => {
                Driver::Local(LocalDriver::new(params.launch.clone()))
            }
            ConnectionParameters::RemoteShell(params) => {
                Driver::RemoteShell(RemoteShellDriver::new(params.clone()))
            }
            ConnectionParameters::Device(params) => {
                Driver::Device(DeviceDriver::new(params.device_path.clone()))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Driver::Local(_) => BackendKind::Local,
            Driver::RemoteShell(_) => BackendKind::RemoteShell,
            Driver::Device(_) => BackendKind::Device,
        }
    }

    /// How submitted commands are turned into executable forms.
    pub fn command_policy(&self) -> CommandPolicy {
        match self {
            Driver::Local(_) => CommandPolicy::ArgvOnly,
            Driver::RemoteShell(driver) => driver.policy(),
            Driver::Device(_) => CommandPolicy::AllowListedShell,
        }
    }

    pub fn capabilities(&self) -> DriverCapabilities {
        let policy = self.command_policy();
        DriverCapabilities {
            kind: self.kind(),
            construction: policy.construction(),
            accepts_raw_shell_line: policy.accepts_raw_shell_line(),
            dialect: policy.dialect(),
            has_process: !matches!(self, Driver::Device(_)),
        }
    }

    pub fn describe_trust_boundary(&self) -> TrustBoundary {
        match self {
            Driver::Local(_) => LocalDriver::trust_boundary(),
            Driver::RemoteShell(_) => RemoteShellDriver::trust_boundary(),
            Driver::Device(_) => DeviceDriver::trust_boundary(),
        }
    }

    pub async fn start(&self, protocol: &ProtocolConfig) -> Result<BackendLink> {
        match self {
            Driver::Local(driver) => driver.start(protocol).await,
            Driver::RemoteShell(driver) => driver.start(protocol).await,
            Driver::Device(driver) => driver.start(protocol).await,
        }
    }

    /// Tears down what `start` produced: closes the backend's input, then
    /// gives any process `grace` to exit before killing it. Device links are
    /// released by dropping their halves.
    pub async fn stop(
        &self,
        writer: Option<FrameSender>,
        process: Option<BackendProcess>,
        grace: Duration,
    ) -> Option<ExitStatus> {
        if let Some(mut writer) = writer {
            if let Err(err) = writer.close().await {
                tracing::debug!("Closing {} input failed: {}", self.kind().as_str(), err);
            }
        }
        let mut process = process?;
        let status = process.shutdown(grace).await;
        tracing::debug!("Backend {} exited with {:?}", process.label(), status);
        status
    }
}
