//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;

pub use error::{ErrorCode, ReplogError};
pub use print::logger_init;
