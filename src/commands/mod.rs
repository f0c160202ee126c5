pub mod config_cmd;
pub mod daemon;
pub mod serve;
