use std::sync::{Mutex, PoisonError};

use contour_core::{ContourError, ProtocolConfig, Result};
use contour_types::{CommandConstruction, TrustBoundary};
use tokio::io::{AsyncRead, AsyncWrite};

use super::BackendLink;
use crate::transport::Channel;

/// Any bidirectional byte stream that can stand in for a device node.
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DeviceStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Backend on an embedded board behind a serial-like link.
pub struct DeviceDriver {
    device_path: String,
    attached: Mutex<Option<Box<dyn DeviceStream>>>,
}

impl DeviceDriver {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            attached: Mutex::new(None),
        }
    }

    /// Uses `stream` instead of opening the device node. The stream is
    /// consumed by the first start.
    pub fn with_stream<S>(device_path: impl Into<String>, stream: S) -> Self
    where
        S: DeviceStream + 'static,
    {
        Self {
            device_path: device_path.into(),
            attached: Mutex::new(Some(Box::new(stream))),
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub(crate) async fn start(&self, protocol: &ProtocolConfig) -> Result<BackendLink> {
        let attached = self
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let channel = match attached {
            Some(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                Channel::new(reader, writer, protocol.framing, protocol.max_frame_bytes)
            }
            None => {
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&self.device_path)
                    .await
                    .map_err(|err| open_error(&self.device_path, err))?;
                let (reader, writer) = tokio::io::split(file);
                Channel::new(reader, writer, protocol.framing, protocol.max_frame_bytes)
            }
        };
        tracing::info!("Opened device link {}", self.device_path);
        Ok(BackendLink {
            channel,
            process: None,
            stderr: None,
        })
    }

    pub fn trust_boundary() -> TrustBoundary {
        TrustBoundary {
            label: "device link",
            transport_authenticated: false,
            transport_encrypted: false,
            construction: CommandConstruction::AllowListedShellLine,
            backend_output_trusted: false,
            notes: "A serial-like link to a minimal on-device shell whose quoting rules are not \
                    known. Tokens are checked against [A-Za-z0-9._/-] and refused otherwise; \
                    nothing is escaped.",
        }
    }
}

impl std::fmt::Debug for DeviceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDriver")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

fn open_error(path: &str, err: std::io::Error) -> ContourError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            ContourError::BackendUnavailable(format!("device {} not found", path))
        }
        std::io::ErrorKind::PermissionDenied => {
            ContourError::BackendUnavailable(format!("no permission to open device {}", path))
        }
        _ => ContourError::BackendUnavailable(format!("failed to open device {}: {}", path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contour_types::Frame;

    #[tokio::test]
    async fn missing_device_node_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ttyACM9");
        let driver = DeviceDriver::new(path.to_string_lossy().to_string());
        let err = driver
            .start(&ProtocolConfig::default())
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, ContourError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn attached_stream_is_used_once() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("link").to_string_lossy().to_string();
        let driver = DeviceDriver::with_stream(missing, ours);
        let link = driver
            .start(&ProtocolConfig::default())
            .await
            .expect("start with stream");
        assert!(link.process.is_none());

        let (mut sender, _receiver) = link.channel.split();
        sender
            .send(&Frame::new().with("kind", "hello").with("id", 0_i64))
            .await
            .expect("send");
        drop(theirs);

        let second = driver.start(&ProtocolConfig::default()).await;
        assert!(matches!(second, Err(ContourError::BackendUnavailable(_))));
    }
}
