pub mod api;
pub mod command;
pub mod config;
pub mod error;
pub mod error_payload;
pub mod logs;
pub mod port_alloc;
pub mod proxy;
pub mod recovery;
pub mod registry;
pub mod service;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod workspace;
