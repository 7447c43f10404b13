use std::time::Duration;

use chrono::{DateTime, Utc};

const DEFAULT_PORT: u16 = 8883;
const DEFAULT_KEEP_ALIVE: u16 = 10;
const API_VERSION: &str = "2018-06-30";

/// Provides the password used to authenticate the MQTT CONNECT.
///
/// How the token is produced (SAS signing, X.509, Edge workload API) is a
/// concern of the layer above; the transport only needs an opaque string
/// valid until `expiry`.
pub trait TokenSource {
    /// A token valid until the given expiry
    fn get(&self, expiry: &DateTime<Utc>) -> String;
}

impl std::fmt::Debug for dyn TokenSource + Send + Sync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSource")
    }
}

/// Token source backed by a pre-generated shared access signature.
#[derive(Debug, Clone)]
pub struct SasTokenSource {
    sas: String,
}

impl SasTokenSource {
    /// Wrap an already generated shared access signature
    pub fn new(sas: impl Into<String>) -> Self {
        SasTokenSource { sas: sas.into() }
    }
}

impl TokenSource for SasTokenSource {
    fn get(&self, _: &DateTime<Utc>) -> String {
        self.sas.clone()
    }
}

/// Connection identity and negotiated transport parameters.
///
/// Carried through the handler and into the channel factory; a substitute
/// channel used in tests receives the same object as the TLS channel.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// IoT hub host name, e.g. `myhub.azure-devices.net`
    pub hostname: String,
    /// The registered device identity
    pub device_id: String,
    /// Module identity when connecting as an Edge/module client
    pub module_id: Option<String>,
    /// Broker port, 8883 unless overridden
    pub port: u16,
    /// MQTT keep-alive interval in seconds
    pub keep_alive: u16,
    /// Whether to ask the broker for a clean session
    pub clean_session: bool,
    /// Window to wait for a SUBSCRIBE/UNSUBSCRIBE acknowledgement
    pub ack_timeout: Duration,
    /// Window to wait for a twin GET/PATCH response
    pub twin_timeout: Duration,
}

impl TransportSettings {
    /// Settings for a device client with the defaults the hub expects.
    pub fn new(hostname: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            device_id: device_id.into(),
            module_id: None,
            port: DEFAULT_PORT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: false,
            ack_timeout: Duration::from_secs(30),
            twin_timeout: Duration::from_secs(60),
        }
    }

    /// Settings for a module client
    pub fn new_module(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        module_id: impl Into<String>,
    ) -> Self {
        let mut settings = Self::new(hostname, device_id);
        settings.module_id = Some(module_id.into());
        settings
    }

    /// The client identifier presented in the CONNECT packet
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        }
    }

    /// The CONNECT user name, `{hub}/{clientId}/?api-version=...`
    pub fn user_name(&self) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.hostname,
            self.client_id(),
            API_VERSION
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_client_id_is_device_id() {
        let settings = TransportSettings::new("myhub.azure-devices.net", "dev1");
        assert_eq!(settings.client_id(), "dev1");
        assert_eq!(
            settings.user_name(),
            "myhub.azure-devices.net/dev1/?api-version=2018-06-30"
        );
    }

    #[test]
    fn module_client_id_includes_module() {
        let settings = TransportSettings::new_module("myhub.azure-devices.net", "dev1", "mod1");
        assert_eq!(settings.client_id(), "dev1/mod1");
    }

    #[test]
    fn sas_token_source_returns_configured_token() {
        let source = SasTokenSource::new("SharedAccessSignature sr=hub&sig=abc&se=1");
        assert_eq!(
            source.get(&Utc::now()),
            "SharedAccessSignature sr=hub&sig=abc&se=1"
        );
    }
}
