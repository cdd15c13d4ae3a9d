pub mod audit;
pub mod config;
pub mod migrate;
pub mod rebuild;
pub mod render;
pub mod resolver;
pub mod rules;
pub mod runtime;
pub mod store;
pub mod sync;
