//! Server and listener configuration.
//!
//! Options are normalized and validated up front; a listener is never
//! created from an invalid configuration.

use std::fmt;
use std::sync::Arc;

use crate::codec::TextEncoding;
use crate::error::{Error, Result};
use crate::hl7::{assert_number, random_string, valid_ipv4, valid_ipv6, Message};

/// Characters a listener name must not contain.
const NAME_FORMAT: &str = " `!@#$%^&*()+-=[]{};':\"\\|,.<>/?~";

/// The highest port the validator accepts.
const PORT_MAX: u32 = 65353;

/// TLS material for the listening socket, all in PEM form.
#[derive(Clone)]
pub struct TlsOptions {
    /// Server private key.
    pub key: Vec<u8>,
    /// Server certificate chain.
    pub cert: Vec<u8>,
    /// CA bundle used to verify client certificates.
    pub ca: Option<Vec<u8>>,
    /// Require clients to present a certificate signed by `ca`.
    pub request_cert: bool,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("request_cert", &self.request_cert)
            .finish()
    }
}

/// Server-wide options shared by every listener it creates.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Address the listening sockets bind to.
    pub bind_address: String,
    /// Treat `bind_address` as IPv4. Mutually exclusive with `ipv6`.
    pub ipv4: bool,
    /// Treat `bind_address` as IPv6. Mutually exclusive with `ipv4`.
    pub ipv6: bool,
    /// Default payload encoding for listeners that don't set their own.
    pub encoding: TextEncoding,
    /// When present, listeners accept TLS instead of plain TCP.
    pub tls: Option<TlsOptions>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            bind_address: "0.0.0.0".to_string(),
            ipv4: true,
            ipv6: false,
            encoding: TextEncoding::default(),
            tls: None,
        }
    }
}

/// An MSH field override applied to every acknowledgment a listener builds.
///
/// Either a literal replacement value or a derivation from the original
/// inbound message. The variant is checked at configuration time by
/// construction, so no runtime type validation is needed.
#[derive(Clone)]
pub enum MshOverride {
    /// Replace the field with this value.
    Value(String),
    /// Replace the field with the function's result for the inbound message.
    Derive(Arc<dyn Fn(&Message) -> String + Send + Sync>),
}

impl MshOverride {
    pub(crate) fn resolve(&self, message: &Message) -> String {
        match self {
            MshOverride::Value(value) => value.clone(),
            MshOverride::Derive(derive) => derive(message),
        }
    }
}

impl fmt::Debug for MshOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MshOverride::Value(value) => f.debug_tuple("Value").field(value).finish(),
            MshOverride::Derive(_) => f.write_str("Derive(..)"),
        }
    }
}

impl From<&str> for MshOverride {
    fn from(value: &str) -> Self {
        MshOverride::Value(value.to_string())
    }
}

impl From<String> for MshOverride {
    fn from(value: String) -> Self {
        MshOverride::Value(value)
    }
}

/// Options for one inbound listener.
#[derive(Clone, Debug)]
pub struct ListenerOptions {
    /// Port to listen on. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Listener name used in logs. Randomized when not set.
    pub name: Option<String>,
    /// Payload encoding, falling back to the server default.
    pub encoding: Option<TextEncoding>,
    /// MSH field overrides applied to every built acknowledgment,
    /// keyed by the MSH sub-field path (e.g. `"4"` or `"9.3"`).
    /// Applied in declaration order; later entries win on the same path.
    pub msh_overrides: Vec<(String, MshOverride)>,
}

impl ListenerOptions {
    pub fn new(port: u16) -> Self {
        ListenerOptions {
            port,
            name: None,
            encoding: None,
            msh_overrides: Vec::new(),
        }
    }

    /// Add an MSH field override.
    pub fn msh_override(mut self, path: &str, value: impl Into<MshOverride>) -> Self {
        self.msh_overrides.push((path.to_string(), value.into()));
        self
    }
}

pub(crate) fn normalize_server_options(mut options: ServerOptions) -> Result<ServerOptions> {
    if options.ipv4 && options.ipv6 {
        return Err(Error::Server(
            "ipv4 and ipv6 both can't be set to be exclusive.".to_string(),
        ));
    }
    if !options.ipv4 && !options.ipv6 {
        options.ipv4 = true;
    }

    if options.bind_address != "localhost" {
        if options.ipv6 && !valid_ipv6(&options.bind_address) {
            return Err(Error::Server(
                "bindAddress is an invalid ipv6 address.".to_string(),
            ));
        }
        if options.ipv4 && !valid_ipv4(&options.bind_address) {
            return Err(Error::Server(
                "bindAddress is an invalid ipv4 address.".to_string(),
            ));
        }
    }

    Ok(options)
}

pub(crate) fn normalize_listener_options(
    mut options: ListenerOptions,
    default_encoding: TextEncoding,
) -> Result<ListenerOptions> {
    match &options.name {
        None => options.name = Some(random_string()),
        Some(name) => {
            if name.chars().any(|c| NAME_FORMAT.contains(c)) {
                return Err(Error::Listener(format!(
                    "name must not contain certain characters: {}",
                    NAME_FORMAT
                )));
            }
        }
    }

    if options.encoding.is_none() {
        options.encoding = Some(default_encoding);
    }

    assert_number(u32::from(options.port), "port", 0, PORT_MAX)?;

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_options_validate() {
        let options = normalize_server_options(ServerOptions::default()).unwrap();
        assert_eq!(options.bind_address, "0.0.0.0");
        assert!(options.ipv4);
        assert!(!options.ipv6);
    }

    #[test]
    fn ipv4_and_ipv6_are_mutually_exclusive() {
        let options = ServerOptions {
            ipv4: true,
            ipv6: true,
            ..ServerOptions::default()
        };
        assert!(normalize_server_options(options).is_err());
    }

    #[test]
    fn bind_address_must_match_the_family() {
        let options = ServerOptions {
            bind_address: "::1".to_string(),
            ..ServerOptions::default()
        };
        assert!(normalize_server_options(options).is_err());

        let options = ServerOptions {
            bind_address: "::1".to_string(),
            ipv4: false,
            ipv6: true,
            ..ServerOptions::default()
        };
        assert!(normalize_server_options(options).is_ok());
    }

    #[test]
    fn localhost_skips_address_validation() {
        let options = ServerOptions {
            bind_address: "localhost".to_string(),
            ..ServerOptions::default()
        };
        assert!(normalize_server_options(options).is_ok());
    }

    #[test]
    fn missing_name_gets_randomized() {
        let options =
            normalize_listener_options(ListenerOptions::new(3000), TextEncoding::default())
                .unwrap();
        let name = options.name.unwrap();
        assert!(!name.is_empty());
    }

    #[test]
    fn bad_name_characters_are_fatal() {
        for bad in &["with space", "semi;colon", "back\\slash", "tick`name"] {
            let mut options = ListenerOptions::new(3000);
            options.name = Some((*bad).to_string());
            assert!(
                normalize_listener_options(options, TextEncoding::default()).is_err(),
                "{:?} should have been rejected",
                bad
            );
        }

        let mut options = ListenerOptions::new(3000);
        options.name = Some("plain_name_01".to_string());
        assert!(normalize_listener_options(options, TextEncoding::default()).is_ok());
    }

    #[test]
    fn port_upper_bound_is_enforced() {
        assert!(
            normalize_listener_options(ListenerOptions::new(65353), TextEncoding::default())
                .is_ok()
        );
        assert!(
            normalize_listener_options(ListenerOptions::new(65354), TextEncoding::default())
                .is_err()
        );
    }

    #[test]
    fn listener_encoding_falls_back_to_server_default() {
        let options =
            normalize_listener_options(ListenerOptions::new(3000), TextEncoding::Latin1).unwrap();
        assert_eq!(options.encoding, Some(TextEncoding::Latin1));
    }

    #[test]
    fn override_builder_preserves_declaration_order() {
        let options = ListenerOptions::new(3000)
            .msh_override("4", "FIRST")
            .msh_override("4", "SECOND");

        assert_eq!(options.msh_overrides.len(), 2);
        assert_eq!(options.msh_overrides[0].0, "4");
        match &options.msh_overrides[1].1 {
            MshOverride::Value(v) => assert_eq!(v, "SECOND"),
            _ => panic!("expected a literal override"),
        }
    }
}
