pub mod config;
pub mod db;
pub mod explorer;
pub mod ingest;
pub mod validate;

mod test_utils;
