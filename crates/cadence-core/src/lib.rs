pub mod config;
pub mod error;
pub mod types;

pub use error::{CadenceError, Result};
pub use types::{OrgId, RunId, TaskId};
