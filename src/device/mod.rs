pub mod manager;
pub mod models;
pub mod registry;

pub use manager::{SessionManager, StreamInfo};
pub use models::*;
pub use registry::{DeviceRegistry, ManualOverride};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Device enumeration failed: {0}")]
    Enumeration(#[from] std::io::Error),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        "ENUMERATION_FAILED"
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
