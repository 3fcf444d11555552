pub mod auth;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod handshake;
pub mod packet;
pub mod protocol;
pub mod resultset;
pub mod server;
pub mod statement;
pub mod stream;
pub mod tls;

#[cfg(test)]
mod protocol_tests;

pub use auth::AuthPlugin;
pub use codec::PacketIo;
pub use connection::{ConnStatus, Connection, ConnectionHandle};
pub use server::{MysqlServer, ServerContext};
pub use stream::ConnStream;
