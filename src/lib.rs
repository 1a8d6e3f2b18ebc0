pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod ingest;
pub mod model;
pub mod query;
pub mod retention;
pub mod schema;
pub mod spreadsheet;
pub mod sql;
pub mod store;

pub use error::SheetError;
