pub mod approval;
pub mod cancellation;
pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod orchestrator;
pub mod registry;
pub mod store;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 39740;

pub use approval::*;
pub use cancellation::*;
pub use capability::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use event_bus::*;
pub use orchestrator::*;
pub use registry::*;
pub use store::*;
