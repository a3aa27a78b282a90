mod approval;
mod capability;
mod event;
mod ids;
mod intent;
mod task;

pub use approval::*;
pub use capability::*;
pub use event::*;
pub use ids::*;
pub use intent::*;
pub use task::*;
