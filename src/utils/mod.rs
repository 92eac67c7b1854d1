pub mod command;
pub mod network;
