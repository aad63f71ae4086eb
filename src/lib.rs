pub mod concierge;
pub mod config;
