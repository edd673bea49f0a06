pub mod cli;
pub mod commands;
pub mod data;
pub mod error;
pub mod graph;
pub mod replay;
pub mod session;

pub use error::{Error, Result};
