pub mod error;
pub mod types;

pub use error::{DeployError, Result};
pub use types::*;
