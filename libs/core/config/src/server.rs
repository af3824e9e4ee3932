use crate::{env_or_default, ConfigError, FromEnv};
use std::net::Ipv4Addr;

/// Listener ports for a service exposing plain HTTP, gRPC and a REST gateway
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub gateway_port: u16,
}

impl ServerConfig {
    pub fn new(host: String, http_port: u16, grpc_port: u16, gateway_port: u16) -> Self {
        Self {
            host,
            http_port,
            grpc_port,
            gateway_port,
        }
    }

    pub fn http_address(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }

    pub fn grpc_address(&self) -> String {
        format!("{}:{}", self.host, self.grpc_port)
    }

    pub fn gateway_address(&self) -> String {
        format!("{}:{}", self.host, self.gateway_port)
    }
}

fn parse_port(key: &str, default: &str) -> Result<u16, ConfigError> {
    env_or_default(key, default)
        .parse()
        .map_err(|e| ConfigError::ParseError {
            key: key.to_string(),
            details: format!("{}", e),
        })
}

impl FromEnv for ServerConfig {
    /// Reads from environment variables with sensible defaults:
    /// - HOST: defaults to Ipv4Addr::UNSPECIFIED (0.0.0.0 - all interfaces)
    /// - HTTP_PORT: defaults to 8080
    /// - GRPC_PORT: defaults to 50051
    /// - GATEWAY_PORT: defaults to 8081
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("HOST", &Ipv4Addr::UNSPECIFIED.to_string());
        let http_port = parse_port("HTTP_PORT", "8080")?;
        let grpc_port = parse_port("GRPC_PORT", "50051")?;
        let gateway_port = parse_port("GATEWAY_PORT", "8081")?;

        Ok(Self {
            host,
            http_port,
            grpc_port,
            gateway_port,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            http_port: 8080,
            grpc_port: 50051,
            gateway_port: 8081,
        }
    }
}
