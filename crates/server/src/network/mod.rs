//! Network front end: TCP acceptor and per-connection byte pump

pub mod connection;
pub mod server;

pub use connection::ClientConnection;
pub use server::TcpServer;
