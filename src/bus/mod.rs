pub mod common;
pub mod kv;
pub mod logbus;
pub mod mqtt;
pub mod publisher;
