mod machine;
mod plan;
mod retry;
mod scheduler;

pub use machine::*;
pub use plan::*;
pub use retry::*;
pub use scheduler::*;
