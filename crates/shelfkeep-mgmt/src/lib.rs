//! shelfkeep management: catalog CLI and configuration

pub mod cli;
pub mod config;

pub use config::CatalogConfig;
