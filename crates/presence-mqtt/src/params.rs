use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker connection settings. Supplied once, never mutated by the channel.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: Duration,
    pub use_tls: bool,
    /// PEM CA bundle; the platform root store is used when unset.
    pub ca_cert: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: default_client_id(),
            username: None,
            password: None,
            keepalive: DEFAULT_KEEPALIVE,
            use_tls: false,
            ca_cert: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// rumqttc options for these settings. `ca` is the PEM bundle read from
    /// `ca_cert`; without it TLS verifies against the platform root store.
    pub fn mqtt_options(&self, ca: Option<&[u8]>) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keepalive);

        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }

        if self.use_tls {
            let tls = match ca {
                Some(ca) => TlsConfiguration::Simple { ca: ca.to_vec(), alpn: None, client_auth: None },
                None => TlsConfiguration::default(),
            };
            options.set_transport(Transport::tls_with_config(tls));
        }

        options
    }
}

/// `presence-<pid>`: unique per process so two publishers do not kick each other off.
pub fn default_client_id() -> String {
    format!("presence-{}", std::process::id())
}

// Hand-written so the password never reaches a log line.
impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("keepalive", &self.keepalive)
            .field("use_tls", &self.use_tls)
            .field("ca_cert", &self.ca_cert)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = ConnectionParams::new("broker.local", DEFAULT_PORT);
        assert_eq!(p.port, 1883);
        assert_eq!(p.keepalive, Duration::from_secs(60));
        assert_eq!(p.connect_timeout, Duration::from_secs(5));
        assert!(!p.use_tls);
        assert!(p.client_id.starts_with("presence-"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut p = ConnectionParams::new("broker.local", 8883);
        p.password = Some("hunter2".into());
        let dbg = format!("{p:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn test_mqtt_options() {
        let mut p = ConnectionParams::new("broker.local", 1883);
        p.client_id = "sensor-1".into();
        p.username = Some("sensor".into());
        p.keepalive = Duration::from_secs(30);
        let options = p.mqtt_options(None);
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.client_id(), "sensor-1");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(options.credentials(), Some(("sensor".to_string(), String::new())));
        assert!(matches!(options.transport(), Transport::Tcp));
    }
}
