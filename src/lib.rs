pub mod agent;
pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod shutdown;
pub mod supervisor;
