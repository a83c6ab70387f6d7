pub mod client;
pub mod config;
pub mod models;
pub mod normalize;
pub mod observer;
pub mod routes;
pub mod service;
pub mod session;
pub mod sse;
