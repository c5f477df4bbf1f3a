pub mod config;
pub mod config_file;
pub mod db;
pub mod error;
pub mod traits;
pub mod types;
