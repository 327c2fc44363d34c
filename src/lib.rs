pub mod agent;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod health;
pub mod mapper;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod sink;
