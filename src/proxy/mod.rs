//! MySQL Protocol Front End
//!
//! Wire protocol codec plus the client listener that accepts MySQL
//! connections and proxies them to backend servers through the DCB layer.

pub mod listener;
pub mod protocol;

pub use listener::{run_listener, ClientHandler};
pub use protocol::{MySqlPacket, PacketType, RepHeader};
