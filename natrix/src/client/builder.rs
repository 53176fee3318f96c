use std::time::Duration;

use natrix_net::DEFAULT_WRITE_HIGH_WATER;
use natrix_proto::{ServerAddr, Subject};

use crate::auth::AuthenticationMethod;
use crate::connector::ConnectError;
use crate::core::Client;

/// A builder for [`Client`]
///
/// Obtained from [`Client::builder`].
#[derive(Debug)]
pub struct ClientBuilder {
    pub(crate) servers: Vec<ServerAddr>,
    pub(crate) client_name: String,
    pub(crate) auth_method: Option<AuthenticationMethod>,
    pub(crate) require_headers: bool,
    pub(crate) no_randomize: bool,
    pub(crate) reconnect: bool,
    pub(crate) max_reconnect_attempts: Option<u32>,
    pub(crate) reconnect_time_wait: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_out: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) echo: Echo,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) retry_on_lame_duck: bool,
    pub(crate) flush_interval: Duration,
    pub(crate) write_high_water: usize,
    pub(crate) inbox_prefix: Subject,
    pub(crate) default_response_timeout: Duration,
}

/// Whether or not to allow messages published by this client to be echoed back to its own subscriptions
#[derive(Debug, Copy, Clone, Default)]
pub enum Echo {
    /// Do not allow messages published by this client to be echoed back to its own [`Subscription`]s
    ///
    /// [`Subscription`]: crate::core::Subscription
    #[default]
    Prevent,
    /// Allow messages published by this client to be echoed back to its own [`Subscription`]s
    ///
    /// [`Subscription`]: crate::core::Subscription
    Allow,
}

impl ClientBuilder {
    pub(super) fn new() -> Self {
        Self {
            servers: Vec::new(),
            client_name: "natrix".to_owned(),
            auth_method: None,
            require_headers: false,
            no_randomize: false,
            reconnect: true,
            max_reconnect_attempts: Some(60),
            reconnect_time_wait: Duration::from_secs(2),
            ping_interval: Duration::from_secs(10),
            max_pings_out: 2,
            connect_timeout: Duration::from_secs(5),
            echo: Echo::Prevent,
            verbose: true,
            pedantic: false,
            retry_on_lame_duck: false,
            flush_interval: Duration::ZERO,
            write_high_water: DEFAULT_WRITE_HIGH_WATER,
            inbox_prefix: Subject::from_static("_INBOX"),
            default_response_timeout: Duration::from_secs(5),
        }
    }

    /// Add a seed server to connect to
    ///
    /// May be called multiple times. When no server is given the
    /// client connects to `nats://127.0.0.1:4222`.
    #[must_use]
    pub fn server(mut self, addr: ServerAddr) -> Self {
        self.servers.push(addr);
        self
    }

    /// Add multiple seed servers to connect to
    #[must_use]
    pub fn servers<I: IntoIterator<Item = ServerAddr>>(mut self, addrs: I) -> Self {
        self.servers.extend(addrs);
        self
    }

    /// Define the client name forwarded to the server in the handshake
    ///
    /// Default: `natrix`
    #[must_use]
    pub fn client_name(mut self, client_name: String) -> Self {
        self.client_name = client_name;
        self
    }

    /// Define an authentication method
    #[must_use]
    pub fn authentication_method(mut self, auth_method: Option<AuthenticationMethod>) -> Self {
        self.auth_method = auth_method;
        self
    }

    /// Install a username and password authenticator
    #[must_use]
    pub fn user_and_password(self, username: String, password: String) -> Self {
        self.authentication_method(Some(AuthenticationMethod::UserAndPassword {
            username,
            password,
        }))
    }

    /// Install a token authenticator
    #[must_use]
    pub fn token(self, token: String) -> Self {
        self.authentication_method(Some(AuthenticationMethod::Token { token }))
    }

    /// Require server support for message headers
    ///
    /// When set, connecting to a server that doesn't support headers
    /// fails with [`ConnectError::ServerOptionUnavailable`] instead of
    /// silently degrading.
    ///
    /// Default: `false`
    #[must_use]
    pub fn require_headers(mut self, require_headers: bool) -> Self {
        self.require_headers = require_headers;
        self
    }

    /// Disable randomization of the server pool
    ///
    /// By default the pool order is shuffled, and servers discovered
    /// through cluster gossip are inserted at random positions.
    ///
    /// Default: `false`
    #[must_use]
    pub fn no_randomize(mut self, no_randomize: bool) -> Self {
        self.no_randomize = no_randomize;
        self
    }

    /// Enable or disable automatic reconnects
    ///
    /// Default: `true`
    #[must_use]
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Cap the reconnect attempts made against each server
    ///
    /// Once every server in the pool exhausts its budget the
    /// connection is permanently closed. `None` retries forever.
    ///
    /// Default: 60
    #[must_use]
    pub fn max_reconnect_attempts(mut self, max_reconnect_attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = max_reconnect_attempts;
        self
    }

    /// Define the base backoff between reconnect attempts
    ///
    /// The effective wait grows linearly with the per-server attempt
    /// count and is jittered by ±50%.
    ///
    /// Default: 2 seconds
    #[must_use]
    pub fn reconnect_time_wait(mut self, reconnect_time_wait: Duration) -> Self {
        self.reconnect_time_wait = reconnect_time_wait;
        self
    }

    /// Define the interval between client heartbeats
    ///
    /// Default: 10 seconds
    #[must_use]
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// Define how many heartbeats may go unanswered before the
    /// connection is declared dead
    ///
    /// Default: 2
    #[must_use]
    pub fn max_pings_out(mut self, max_pings_out: usize) -> Self {
        self.max_pings_out = max_pings_out;
        self
    }

    /// Define the handshake deadline
    ///
    /// Bounds the entire connection establishment, from the TCP dial
    /// to the `PONG` confirming the `CONNECT`.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Whether or not to allow messages published by this client to be echoed back to its own [`Subscription`]s
    ///
    /// Default: [`Echo::Prevent`].
    ///
    /// [`Subscription`]: crate::core::Subscription
    #[must_use]
    pub fn echo(mut self, echo: Echo) -> Self {
        self.echo = echo;
        self
    }

    /// Have the server acknowledge every operation with `+OK`
    ///
    /// Acknowledgements let the client correlate server errors with
    /// the operations that caused them.
    ///
    /// Default: `true`
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Have the server run additional protocol checks
    ///
    /// Default: `false`
    #[must_use]
    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.pedantic = pedantic;
        self
    }

    /// Proactively reconnect to another pool member when the
    /// connected server enters lame duck mode
    ///
    /// Default: `false`
    #[must_use]
    pub fn retry_on_lame_duck(mut self, retry_on_lame_duck: bool) -> Self {
        self.retry_on_lame_duck = retry_on_lame_duck;
        self
    }

    /// Define a flush interval
    ///
    /// Setting a non-zero flush interval allows the client to generate
    /// larger TLS and TCP packets at the cost of increased latency. Using
    /// a value greater than a few seconds may break the client in
    /// unexpected ways.
    ///
    /// Setting this to [`Duration::ZERO`] causes the client to send messages
    /// as fast as the network will allow, trading off smaller packets for
    /// lower latency.
    ///
    /// Default: 0
    #[must_use]
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Bound the outbound queue
    ///
    /// Once the queue holds more than this many bytes the client stops
    /// accepting new frames; `try_`-publishes fail fast and awaiting
    /// publishes wait for the queue to drain.
    #[must_use]
    pub fn write_high_water(mut self, write_high_water: usize) -> Self {
        self.write_high_water = write_high_water;
        self
    }

    /// Configure the inbox prefix to which replies from the server will be received
    ///
    /// Default: `_INBOX`
    #[must_use]
    pub fn inbox_prefix(mut self, inbox_prefix: Subject) -> Self {
        self.inbox_prefix = inbox_prefix;
        self
    }

    /// The default timeout for [`ResponseFut`]
    ///
    /// Defines how long we should wait for a response in [`Client::request`].
    ///
    /// Default: 5 seconds.
    ///
    /// [`ResponseFut`]: crate::core::request::ResponseFut
    #[must_use]
    pub fn default_response_timeout(mut self, timeout: Duration) -> Self {
        self.default_response_timeout = timeout;
        self
    }

    /// Creates a new [`Client`], connecting to the configured servers.
    ///
    /// # Errors
    ///
    /// It returns an error if no server can be connected to.
    pub async fn connect(self) -> Result<Client, ConnectError> {
        Client::connect(self).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
