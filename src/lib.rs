pub mod catalog;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod maintenance;
pub mod models;
pub mod payments;
pub mod retry;
pub mod util;
