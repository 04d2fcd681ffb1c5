pub mod error;

pub use error::{AccelError, Result};
