//! Core functionality: protocol engine, register catalog, transports,
//! transaction client and polling service.

pub mod client;
pub mod poller;
pub mod protocol;
pub mod registers;
pub mod transport;
