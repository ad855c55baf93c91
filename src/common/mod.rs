pub mod config;
pub mod error;
pub(crate) mod io_utils;

pub use config::Config;
