//! sqlgate-wire — the subset of the MySQL client/server protocol the proxy speaks.
//!
//! Both sides of the proxy use this crate: the session handler plays the
//! server role towards clients, and the backend connector plays the client
//! role towards the database.
//!
//! ```text
//! client ──HandshakeV10──▶ ... ◀──HandshakeResponse41── client
//!          [len: 3 bytes LE] [seq: 1 byte] [payload ...]
//! ```
//!
//! Payload bytes are never interpreted beyond what routing and response
//! framing need.

pub mod auth;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod packet;
pub mod response;

pub use error::{WireError, WireResult};
pub use handshake::{HandshakeResponse, InitialHandshake};
pub use packet::PacketConn;
pub use response::ServerError;

/// Command bytes (first payload byte of a client command packet).
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_INIT_DB: u8 = 0x02;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_FIELD_LIST: u8 = 0x04;
    pub const COM_STATISTICS: u8 = 0x09;
    pub const COM_PING: u8 = 0x0e;
    pub const COM_STMT_PREPARE: u8 = 0x16;
    pub const COM_RESET_CONNECTION: u8 = 0x1f;
}

/// Capability flags negotiated during the handshake.
pub mod capability {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_SSL: u32 = 0x0000_0800;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
    pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

    /// Capabilities the proxy negotiates on both legs.
    ///
    /// Both legs must agree on everything that changes response framing
    /// (`CLIENT_PROTOCOL_41`, no `CLIENT_DEPRECATE_EOF`, no session tracking)
    /// so backend responses can be relayed to clients unmodified.
    pub const PROXY_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags carried by OK and EOF packets.
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// `utf8mb4_general_ci`, used on the backend leg.
pub const CHARSET_UTF8MB4_GENERAL_CI: u8 = 45;
