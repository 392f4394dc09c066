pub mod cli;
pub mod error;
pub mod logging;
pub mod resp;
pub mod supervisor;

pub use error::{Error, Result};
pub use supervisor::config::{PrimaryConfig, SupervisorConfig};
pub use supervisor::state::SupervisorState;
