pub use self::connection::{StreamingConnection, DEFAULT_WRITE_HIGH_WATER};
pub use self::happy_eyeballs::connect as connect_tcp;
pub use self::security::{tls_connector, ConnectionSecurity};

mod connection;
mod happy_eyeballs;
mod security;

pub mod error {
    pub use super::connection::StreamingReadError;
}
