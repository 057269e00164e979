pub mod config;
pub mod provisioner;
