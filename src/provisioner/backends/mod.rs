pub mod api;
pub mod exec;
