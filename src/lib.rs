pub mod agent;
pub mod api;
pub mod constants;
pub mod error;
pub mod utils;

pub use error::{Error, Result};
