//! Backend sessions, drivers and supervision for Contour.

pub mod agent;
pub mod artifacts;
pub mod circuit;
pub mod driver;
pub mod escape_hatch;
pub mod session;
pub mod stderr_tail;
pub mod supervisor;
pub mod transport;

pub use artifacts::{
    downloadable_models, file_name_from_url, hf_url, recommended_model, ArtifactFetcher, CatalogEntry,
    DownloadProgress, ModelFile, DEFAULT_REVISION,
};
pub use circuit::{CircuitBreaker, CircuitState};
pub use driver::{
    BackendLink, BackendProcess, DeviceDriver, DeviceStream, Driver, DriverCapabilities,
    LocalDriver, RemoteShellDriver,
};
pub use escape_hatch::{ShellOutput, TrustedShell};
pub use stderr_tail::{StderrLine, StderrTail};
pub use session::{PendingRequest, Session, SessionSettings};
pub use supervisor::{CommandHandle, DriverFactory, Supervisor, SupervisorSettings, SubmitOptions};
pub use transport::{Channel, FrameReceiver, FrameSender};
