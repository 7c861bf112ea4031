pub mod config;
pub mod data;
pub mod report_error;
pub mod util;
