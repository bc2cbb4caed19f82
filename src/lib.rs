pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod project;
pub mod record;
pub mod session;
pub mod summary;
pub mod util;
