pub mod config;
pub mod dates;
pub mod document;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod ids;
pub mod loader;
pub mod mapper;
pub mod reader;
pub mod record_key;
pub mod reformat;
pub mod sink;
pub mod time;
