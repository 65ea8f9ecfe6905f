pub mod error;
pub mod types;

pub use error::{ForgeError, ForgeResult};
pub use types::{Backend, EnvironmentStatus};
