use std::io;

use natrix_net::{
    connect_tcp, error::StreamingReadError, tls_connector, ConnectionSecurity, StreamingConnection,
};
use natrix_proto::{
    proto::{error::DecoderError, ClientOp, ServerOp},
    Connect, Host, Protocol, ServerAddr, ServerInfo,
};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{InvalidDnsNameError, ServerName};
use tracing::debug;

use crate::auth::AuthenticationError;
use crate::client::{ClientBuilder, Echo};

/// An error encountered while establishing a connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The transport could not be established or failed mid-handshake
    #[error("io error")]
    Io(#[source] io::Error),
    /// The address hostname is not a valid TLS server name
    #[error("invalid DNS name")]
    InvalidDnsName(#[source] InvalidDnsNameError),
    /// The handshake did not complete within the configured deadline
    #[error("handshake timed out")]
    TimedOut,
    /// The server sent something other than `INFO` first
    #[error("unexpected ServerOp")]
    UnexpectedServerOp,
    /// The server violated the wire protocol
    #[error("decoder error")]
    Decoder(#[source] DecoderError),
    /// The authenticator could not produce credentials
    #[error("authentication error")]
    Authentication(#[source] AuthenticationError),
    /// The server lacks support for a required option
    #[error("server does not support the required `{option}` option")]
    ServerOptionUnavailable { option: &'static str },
    /// The server requires TLS but the address selected plaintext
    ///
    /// Connect with a `tls://` address instead.
    #[error("the server requires a TLS connection")]
    TlsRequired,
    /// The server rejected the handshake
    #[error("server error")]
    Server(#[source] natrix_proto::error::ServerError),
}

pub(crate) type Connection = StreamingConnection<ConnectionSecurity<TcpStream>>;

/// Establish the transport and drive the handshake to completion
///
/// Dials the address, optionally upgrades to TLS, waits for `INFO`,
/// validates compatibility, attaches handshake credentials and
/// confirms the `CONNECT` with a `PING`/`PONG` round trip. The whole
/// sequence is bounded by the builder's handshake deadline.
pub(crate) async fn connect(
    addr: &ServerAddr,
    builder: &ClientBuilder,
) -> Result<(Connection, Box<ServerInfo>), ConnectError> {
    match tokio::time::timeout(builder.connect_timeout, do_connect(addr, builder)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => Err(ConnectError::TimedOut),
    }
}

async fn do_connect(
    addr: &ServerAddr,
    builder: &ClientBuilder,
) -> Result<(Connection, Box<ServerInfo>), ConnectError> {
    let socket = connect_tcp(addr).await.map_err(ConnectError::Io)?;
    socket.set_nodelay(true).map_err(ConnectError::Io)?;
    let mut socket = ConnectionSecurity::Plain(socket);

    if matches!(addr.protocol(), Protocol::TLS) {
        let domain = rustls_server_name_from_addr(addr).map_err(ConnectError::InvalidDnsName)?;
        socket = socket
            .upgrade_tls(&tls_connector(), domain.to_owned())
            .await
            .map_err(ConnectError::Io)?;
    }

    let mut conn = StreamingConnection::new(socket);
    conn.set_write_high_water(builder.write_high_water);

    let info = match conn.read_next().await {
        Ok(ServerOp::Info { info }) => info,
        Ok(_) => return Err(ConnectError::UnexpectedServerOp),
        Err(StreamingReadError::Io(err)) => return Err(ConnectError::Io(err)),
        Err(StreamingReadError::Decoder(err)) => return Err(ConnectError::Decoder(err)),
    };

    if builder.require_headers && !info.supports_headers {
        return Err(ConnectError::ServerOptionUnavailable { option: "headers" });
    }

    // The TLS upgrade happens before the first read, driven by the
    // address scheme. A server demanding TLS on a plaintext address
    // is a configuration mismatch, not something to paper over
    if info.tls_required && !conn.socket().is_tls() {
        return Err(ConnectError::TlsRequired);
    }

    let auth;
    let auth_method = if let Some(auth_method) = &builder.auth_method {
        Some(auth_method)
    } else if let Some(auth_method) = crate::auth::AuthenticationMethod::try_from_addr(addr) {
        auth = auth_method;
        Some(&auth)
    } else {
        None
    };

    let mut connect = Connect {
        verbose: builder.verbose,
        pedantic: builder.pedantic,
        require_tls: matches!(addr.protocol(), Protocol::TLS),
        auth_token: None,
        username: None,
        password: None,
        client_name: Some(builder.client_name.clone()),
        client_lang: "rust-natrix",
        client_version: env!("CARGO_PKG_VERSION"),
        protocol: 1,
        echo: matches!(builder.echo, Echo::Allow),
        signature: None,
        jwt: None,
        supports_no_responders: true,
        supports_headers: true,
        nkey: None,
    };
    if let Some(auth_method) = auth_method {
        auth_method
            .prepare_for_auth(&info, &mut connect)
            .map_err(ConnectError::Authentication)?;
    }

    confirm_connect(&mut conn, connect).await?;
    debug!(server = %addr, server_id = %info.id, "handshake complete");

    Ok((conn, info))
}

/// Send `CONNECT` followed by `PING` and wait for the matching `PONG`
async fn confirm_connect(conn: &mut Connection, connect: Connect) -> Result<(), ConnectError> {
    conn.enqueue_write_op(&ClientOp::Connect {
        connect: Box::new(connect),
    });
    conn.enqueue_write_op(&ClientOp::Ping);
    conn.write_and_flush().await.map_err(ConnectError::Io)?;

    loop {
        match conn.read_next().await {
            Ok(ServerOp::Success) => {
                // Acknowledged. Repeat to receive the PONG
            }
            Ok(ServerOp::Pong) => {
                // We've received the PONG, possibly after an OK
                return Ok(());
            }
            Ok(ServerOp::Ping) => {
                conn.enqueue_write_op(&ClientOp::Pong);
                conn.write_and_flush().await.map_err(ConnectError::Io)?;
            }
            Ok(ServerOp::Error { error }) => return Err(ConnectError::Server(error)),
            Ok(ServerOp::Info { .. } | ServerOp::Message { .. }) => {
                return Err(ConnectError::UnexpectedServerOp);
            }
            Err(StreamingReadError::Decoder(err)) => return Err(ConnectError::Decoder(err)),
            Err(StreamingReadError::Io(err)) => return Err(ConnectError::Io(err)),
        }
    }
}

fn rustls_server_name_from_addr(addr: &ServerAddr) -> Result<ServerName<'_>, InvalidDnsNameError> {
    match addr.host() {
        Host::Ip(addr) => Ok(ServerName::IpAddress((*addr).into())),
        Host::Dns(name) => <_ as AsRef<str>>::as_ref(name).try_into(),
    }
}
