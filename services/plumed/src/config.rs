// Server configuration and startup validation.
use std::net::SocketAddr;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("lame duck grace period ({grace:?}) must be strictly less than duration ({duration:?})")]
    LameDuckGrace { grace: Duration, duration: Duration },
    #[error("server name {0:?} must not contain spaces")]
    ServerNameSpaces(String),
    #[error("max payload must be greater than zero")]
    ZeroMaxPayload,
    #[error("max control line must be at least 128 bytes")]
    ControlLineTooSmall,
    #[error("ping max must be at least 1")]
    ZeroPingMax,
    #[error("route url {0:?} is not host:port")]
    BadRouteUrl(String),
    #[error("routes configured without a cluster listen address")]
    RoutesWithoutCluster,
}

/// Runtime options for one server. Built by the CLI layer, then validated
/// once before any listener binds.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Client listener address.
    pub addr: SocketAddr,
    /// Route listener address; clustering is disabled when unset.
    pub cluster_addr: Option<SocketAddr>,
    /// Explicit cluster name. When unset an ephemeral name is generated and
    /// may be replaced during route negotiation.
    pub cluster_name: Option<String>,
    /// Seed routes to dial, as `host:port` or `plume-route://host:port`.
    pub routes: Vec<String>,
    /// Human-facing server name carried in INFO.
    pub server_name: Option<String>,
    /// Required token for client CONNECT when set.
    pub auth_token: Option<String>,
    pub max_payload: usize,
    pub max_control_line: usize,
    pub max_connections: usize,
    /// Per-connection subscription cap; 0 means unlimited.
    pub max_subscriptions: usize,
    /// Per-connection pending-out byte cap before the slow-consumer policy
    /// closes the connection.
    pub max_pending: usize,
    pub ping_interval: Duration,
    pub ping_max: u32,
    pub write_deadline: Duration,
    pub lame_duck_duration: Duration,
    pub lame_duck_grace: Duration,
    /// How long an account must stay empty before it is removed.
    pub account_grace: Duration,
    /// Dial failures are reported on attempt 1 and every Nth attempt after.
    pub route_report_attempts: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:4322".parse().expect("static addr"),
            cluster_addr: None,
            cluster_name: None,
            routes: Vec::new(),
            server_name: None,
            auth_token: None,
            max_payload: 1024 * 1024,
            max_control_line: 4096,
            max_connections: 65_536,
            max_subscriptions: 0,
            max_pending: 32 * 1024 * 1024,
            ping_interval: Duration::from_secs(120),
            ping_max: 2,
            write_deadline: Duration::from_secs(10),
            lame_duck_duration: Duration::from_secs(120),
            lame_duck_grace: Duration::from_secs(10),
            account_grace: Duration::from_secs(60),
            route_report_attempts: 3,
        }
    }
}

impl ServerConfig {
    /// Validate before serving. Failures here exit the process with status 1.
    pub fn validate(&self) -> Result<()> {
        if self.lame_duck_grace >= self.lame_duck_duration {
            return Err(ConfigError::LameDuckGrace {
                grace: self.lame_duck_grace,
                duration: self.lame_duck_duration,
            });
        }
        if let Some(name) = &self.server_name
            && name.contains(' ')
        {
            return Err(ConfigError::ServerNameSpaces(name.clone()));
        }
        if self.max_payload == 0 {
            return Err(ConfigError::ZeroMaxPayload);
        }
        if self.max_control_line < 128 {
            return Err(ConfigError::ControlLineTooSmall);
        }
        if self.ping_max == 0 {
            return Err(ConfigError::ZeroPingMax);
        }
        if !self.routes.is_empty() && self.cluster_addr.is_none() {
            return Err(ConfigError::RoutesWithoutCluster);
        }
        for route in &self.routes {
            parse_route_url(route)?;
        }
        Ok(())
    }
}

/// Accept `host:port` with an optional `plume-route://` scheme prefix.
pub fn parse_route_url(url: &str) -> Result<SocketAddr> {
    let trimmed = url
        .strip_prefix("plume-route://")
        .or_else(|| url.strip_prefix("plume://"))
        .unwrap_or(url);
    trimmed
        .parse()
        .map_err(|_| ConfigError::BadRouteUrl(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ServerConfig::default().validate().expect("valid");
    }

    #[test]
    fn rejects_grace_not_less_than_duration() {
        let mut config = ServerConfig::default();
        config.lame_duck_duration = Duration::from_secs(5);
        config.lame_duck_grace = Duration::from_secs(10);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LameDuckGrace { .. })
        ));

        // Equal values are also rejected; grace must be strictly less.
        config.lame_duck_grace = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_server_name_with_spaces() {
        let mut config = ServerConfig::default();
        config.server_name = Some("my server".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ServerNameSpaces(_))
        ));
    }

    #[test]
    fn rejects_zero_limits() {
        let mut config = ServerConfig::default();
        config.max_payload = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.ping_max = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_routes_without_cluster_listener() {
        let mut config = ServerConfig::default();
        config.routes = vec!["127.0.0.1:6322".into()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RoutesWithoutCluster)
        ));
    }

    #[test]
    fn parses_route_urls() {
        assert_eq!(
            parse_route_url("127.0.0.1:6322").expect("bare"),
            "127.0.0.1:6322".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_route_url("plume-route://10.0.0.7:6322").expect("scheme"),
            "10.0.0.7:6322".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_route_url("not a url").is_err());
    }
}
