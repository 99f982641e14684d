pub mod cmd;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod net;
pub mod vbox;
pub mod vm;

pub use error::{Error, Result};
