pub mod bridge;
pub mod command;
