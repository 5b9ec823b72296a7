//! Configuration for memdcore
//!
//! Centralized client configuration with sensible defaults.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Credentials handed to the SASL PLAIN exchange
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credential callback invoked once per connection during bootstrap
///
/// Receives the node address being authenticated against.
#[derive(Clone)]
pub struct AuthHandler(Arc<dyn Fn(&str) -> Credentials + Send + Sync>);

impl AuthHandler {
    pub fn new(f: impl Fn(&str) -> Credentials + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Fixed username/password for every node
    pub fn sasl_plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        let credentials = Credentials {
            username: username.into(),
            password: password.into(),
        };
        Self::new(move |_| credentials.clone())
    }

    pub fn credentials(&self, address: &str) -> Credentials {
        (self.0)(address)
    }
}

impl fmt::Debug for AuthHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthHandler(..)")
    }
}

/// Main configuration for an [`Agent`](crate::Agent)
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------
    /// Bucket selected on every connection
    pub bucket_name: String,

    /// Client name sent with HELLO
    pub client_name: String,

    /// Credential callback; `None` skips SASL
    pub auth: Option<AuthHandler>,

    // -------------------------------------------------------------------------
    // Timeouts
    // -------------------------------------------------------------------------
    /// How long agent creation waits for every pipeline to become ready
    pub connect_timeout: Duration,

    /// Per-node TCP connect and bootstrap timeout
    pub server_connect_timeout: Duration,

    /// Deadline for a single KV operation, retries included
    pub op_timeout: Duration,

    /// Deadline for a stats fan-out
    pub stats_timeout: Duration,

    // -------------------------------------------------------------------------
    // Retry and Reconnect
    // -------------------------------------------------------------------------
    /// Delay before retrying a retryable status with no error map hint
    pub retry_delay: Duration,

    /// First reconnect delay; doubled per failed attempt
    pub reconnect_backoff_min: Duration,

    /// Reconnect delay ceiling
    pub reconnect_backoff_max: Duration,

    /// Pipeline housekeeping interval (deadline sweeps, shutdown checks)
    pub io_tick: Duration,

    // -------------------------------------------------------------------------
    // Negotiated Features
    // -------------------------------------------------------------------------
    pub use_mutation_tokens: bool,
    pub use_kv_error_maps: bool,
    pub use_enhanced_errors: bool,
    pub use_xattr: bool,
    pub use_json: bool,
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_name: "default".to_string(),
            client_name: format!("memdcore/{}", crate::VERSION),
            auth: None,
            connect_timeout: Duration::from_secs(7),
            server_connect_timeout: Duration::from_secs(1),
            op_timeout: Duration::from_millis(2500),
            stats_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(10),
            reconnect_backoff_min: Duration::from_millis(50),
            reconnect_backoff_max: Duration::from_secs(2),
            io_tick: Duration::from_millis(10),
            use_mutation_tokens: true,
            use_kv_error_maps: true,
            use_enhanced_errors: true,
            use_xattr: true,
            use_json: true,
            tcp_nodelay: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reconnect delay after `failures` consecutive failed attempts
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(16);
        self.reconnect_backoff_min
            .saturating_mul(factor)
            .min(self.reconnect_backoff_max)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the bucket selected after authentication
    pub fn bucket_name(mut self, name: impl Into<String>) -> Self {
        self.config.bucket_name = name.into();
        self
    }

    /// Set the client name sent with HELLO
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    /// Set the credential callback
    pub fn auth(mut self, handler: AuthHandler) -> Self {
        self.config.auth = Some(handler);
        self
    }

    /// Authenticate every node with SASL PLAIN
    pub fn sasl_plain(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth(AuthHandler::sasl_plain(username, password))
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn server_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.server_connect_timeout = timeout;
        self
    }

    /// Set the per-operation deadline
    pub fn op_timeout(mut self, timeout: Duration) -> Self {
        self.config.op_timeout = timeout;
        self
    }

    pub fn stats_timeout(mut self, timeout: Duration) -> Self {
        self.config.stats_timeout = timeout;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Set the reconnect backoff bounds
    pub fn reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.config.reconnect_backoff_min = min;
        self.config.reconnect_backoff_max = max.max(min);
        self
    }

    pub fn io_tick(mut self, tick: Duration) -> Self {
        self.config.io_tick = tick;
        self
    }

    pub fn use_mutation_tokens(mut self, enabled: bool) -> Self {
        self.config.use_mutation_tokens = enabled;
        self
    }

    pub fn use_kv_error_maps(mut self, enabled: bool) -> Self {
        self.config.use_kv_error_maps = enabled;
        self
    }

    pub fn use_enhanced_errors(mut self, enabled: bool) -> Self {
        self.config.use_enhanced_errors = enabled;
        self
    }

    pub fn use_xattr(mut self, enabled: bool) -> Self {
        self.config.use_xattr = enabled;
        self
    }

    pub fn use_json(mut self, enabled: bool) -> Self {
        self.config.use_json = enabled;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
