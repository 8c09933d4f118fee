pub mod config;
pub mod credentials;
pub mod datalog;
pub mod driver;
pub mod input;
pub mod portal;
#[cfg(not(any(target_arch = "xtensa", target_arch = "riscv32")))]
pub mod storage;
pub mod supervisor;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::ProvisioningConfig;
pub use credentials::{Credential, CredentialStore, RecordError, RecordStorage, StoreError};
pub use datalog::TemperatureLog;
pub use driver::{AccessPointSettings, DriverError, LinkStatus, NetworkDriver, Personality};
pub use input::LongPress;
pub use portal::{
    AssetSource, Method, PortalError, PortalPages, PortalRequest, PortalResponse,
    ProvisioningPortal, SubmissionError,
};
#[cfg(not(any(target_arch = "xtensa", target_arch = "riscv32")))]
pub use storage::DirStorage;
pub use supervisor::ConnectionSupervisor;
pub use types::{NetworkStatus, RestartReason, SupervisorAction, SupervisorState};
