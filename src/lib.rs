pub mod app;
pub mod cli;
pub mod compose;
pub mod config;
pub mod dispatch;
pub mod docker;
pub mod domain;
pub mod error;
pub mod files;
pub mod git;
pub mod inbound;
pub mod outbound;
pub mod shared;
pub mod ssh;
pub mod updater;

pub use error::{Error, Result};
