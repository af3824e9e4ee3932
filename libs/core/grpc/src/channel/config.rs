use core_config::{ConfigError, FromEnv, env_bool, env_duration_secs};
use std::time::Duration;
use tonic::transport::Endpoint;

/// HTTP/2 and TCP settings of an upstream gRPC channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
  // HTTP/2 Keep-Alive
  pub http2_keep_alive_interval: Option<Duration>,
  pub keep_alive_timeout: Duration,
  pub keep_alive_while_idle: bool,

  // Connection settings
  pub connect_timeout: Duration,
  pub timeout: Duration,

  // Window sizes (HTTP/2 flow control)
  pub initial_connection_window_size: Option<u32>,
  pub initial_stream_window_size: Option<u32>,
  pub http2_adaptive_window: bool,

  // TCP settings
  pub tcp_nodelay: bool,
  pub tcp_keepalive: Option<Duration>,
}

impl Default for ChannelConfig {
  fn default() -> Self {
    Self {
      http2_keep_alive_interval: Some(Duration::from_secs(30)),
      keep_alive_timeout: Duration::from_secs(10),
      keep_alive_while_idle: true,
      connect_timeout: Duration::from_secs(5),
      timeout: Duration::from_secs(30),
      initial_connection_window_size: Some(1024 * 1024), // 1MB
      initial_stream_window_size: Some(1024 * 1024),     // 1MB
      http2_adaptive_window: true,
      tcp_nodelay: true,
      tcp_keepalive: Some(Duration::from_secs(30)),
    }
  }
}

impl FromEnv for ChannelConfig {
  /// Reads `UPSTREAM_CONNECT_TIMEOUT_SECS`, `UPSTREAM_TIMEOUT_SECS` and
  /// `UPSTREAM_KEEP_ALIVE`; everything else keeps its default.
  fn from_env() -> Result<Self, ConfigError> {
    let defaults = Self::default();
    let mut config = Self {
      connect_timeout: env_duration_secs("UPSTREAM_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
      timeout: env_duration_secs("UPSTREAM_TIMEOUT_SECS", defaults.timeout)?,
      ..defaults
    };
    if !env_bool("UPSTREAM_KEEP_ALIVE", true)? {
      config = config.without_keep_alive();
    }
    Ok(config)
  }
}

impl ChannelConfig {
  pub fn new() -> Self {
    Self::default()
  }

  /// Set the connection timeout
  ///
  /// # Example
  /// ```ignore
  /// let config = ChannelConfig::new()
  ///     .with_connect_timeout(Duration::from_secs(10));
  /// ```
  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Deadline of every call made through the channel.
  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
    self.http2_keep_alive_interval = Some(interval);
    self
  }

  pub fn without_keep_alive(mut self) -> Self {
    self.http2_keep_alive_interval = None;
    self
  }

  /// Set both connection and stream window sizes to the same value
  pub fn with_window_size(mut self, size: u32) -> Self {
    self.initial_connection_window_size = Some(size);
    self.initial_stream_window_size = Some(size);
    self
  }

  pub(crate) fn apply_to_endpoint(self, mut endpoint: Endpoint) -> Endpoint {
    if let Some(interval) = self.http2_keep_alive_interval {
      endpoint = endpoint.http2_keep_alive_interval(interval);
    }
    endpoint = endpoint
      .keep_alive_timeout(self.keep_alive_timeout)
      .keep_alive_while_idle(self.keep_alive_while_idle)
      .connect_timeout(self.connect_timeout)
      .timeout(self.timeout);

    if let Some(size) = self.initial_connection_window_size {
      endpoint = endpoint.initial_connection_window_size(size);
    }
    if let Some(size) = self.initial_stream_window_size {
      endpoint = endpoint.initial_stream_window_size(size);
    }

    endpoint
      .http2_adaptive_window(self.http2_adaptive_window)
      .tcp_nodelay(self.tcp_nodelay)
      .tcp_keepalive(self.tcp_keepalive)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_config() {
    let config = ChannelConfig::default();
    assert_eq!(config.connect_timeout, Duration::from_secs(5));
    assert_eq!(config.timeout, Duration::from_secs(30));
    assert_eq!(config.initial_connection_window_size, Some(1024 * 1024));
    assert_eq!(config.initial_stream_window_size, Some(1024 * 1024));
    assert!(config.tcp_nodelay);
    assert!(config.http2_adaptive_window);
  }

  #[test]
  fn test_builder_pattern() {
    let config = ChannelConfig::new()
      .with_connect_timeout(Duration::from_secs(10))
      .with_request_timeout(Duration::from_secs(120))
      .with_window_size(2 * 1024 * 1024);

    assert_eq!(config.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.timeout, Duration::from_secs(120));
    assert_eq!(config.initial_connection_window_size, Some(2 * 1024 * 1024));
    assert_eq!(config.initial_stream_window_size, Some(2 * 1024 * 1024));
  }

  #[test]
  fn test_disable_keep_alive() {
    let config = ChannelConfig::new().without_keep_alive();
    assert_eq!(config.http2_keep_alive_interval, None);
  }

  #[test]
  fn test_from_env() {
    temp_env::with_vars(
      [
        ("UPSTREAM_CONNECT_TIMEOUT_SECS", Some("2")),
        ("UPSTREAM_TIMEOUT_SECS", Some("90")),
        ("UPSTREAM_KEEP_ALIVE", Some("false")),
      ],
      || {
        let config = ChannelConfig::from_env().unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert_eq!(config.http2_keep_alive_interval, None);
      },
    );
  }

  #[test]
  fn test_from_env_defaults() {
    temp_env::with_vars_unset(
      ["UPSTREAM_CONNECT_TIMEOUT_SECS", "UPSTREAM_TIMEOUT_SECS", "UPSTREAM_KEEP_ALIVE"],
      || {
        let config = ChannelConfig::from_env().unwrap();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.http2_keep_alive_interval.is_some());
      },
    );
  }
}
