pub mod config;
pub mod error;
pub mod naming;
pub mod registry;
pub mod request_info;
pub mod service;

pub use config::AquamanConfig;
pub use error::AquamanError;
pub use registry::ServiceRegistry;
pub use request_info::RequestInfo;
pub use service::{AuthMode, ServiceDefinition};
