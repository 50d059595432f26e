pub mod artifacts;
pub mod config;
pub mod engine;
pub mod inference;
pub mod routing;
pub mod sandbox;
pub mod session;
pub mod shared;
pub mod sources;
pub mod workers;
