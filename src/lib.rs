pub mod backend;
pub mod board;
pub mod config;
pub mod connection;
pub mod factory;
pub mod gate;
pub mod graph;
pub mod identity;
pub mod logger;
pub mod message;
pub mod node;
pub mod observer;
pub mod persistence;
pub mod port;
pub mod router;
pub mod runtime;
pub mod schema;
pub mod storage;
pub mod transcript;
