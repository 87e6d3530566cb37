pub mod rest;

pub use rest::{create_api_routes, SharedAppState};
