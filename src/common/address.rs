use std::fmt;
use std::str::FromStr;

use lapin::uri::{AMQPScheme, AMQPUri};
use thiserror::Error;

const AMQP_ADDRESS_PREFIX: &str = "amqp://";
const AMQPS_ADDRESS_PREFIX: &str = "amqps://";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid broker address '{address}': {reason}")]
pub struct AddressError {
    pub address: String,
    pub reason: String,
}

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

/// Where the broker lives and how to log in. Parsed once, immutable.
///
/// Accepts `[amqp[s]://][user:password@]host[:port][/vhost]`; the vhost is
/// percent-decoded, so `guest:guest@localhost:8084/%2F` selects vhost `/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    host: String,
    port: u16,
    vhost: String,
    credentials: Credentials,
    tls: bool,
}

impl BrokerAddress {
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(AddressError {
                address: address.to_string(),
                reason: "address is empty".to_string(),
            });
        }

        let uri_text = if trimmed.starts_with(AMQP_ADDRESS_PREFIX)
            || trimmed.starts_with(AMQPS_ADDRESS_PREFIX)
        {
            trimmed.to_string()
        } else {
            format!("{}{}", AMQP_ADDRESS_PREFIX, trimmed)
        };

        let uri = AMQPUri::from_str(&uri_text).map_err(|reason| AddressError {
            address: address.to_string(),
            reason,
        })?;

        if uri.authority.host.is_empty() {
            return Err(AddressError {
                address: address.to_string(),
                reason: "missing host".to_string(),
            });
        }

        Ok(BrokerAddress {
            host: uri.authority.host,
            port: uri.authority.port,
            vhost: uri.vhost,
            credentials: Credentials {
                username: uri.authority.userinfo.username,
                password: uri.authority.userinfo.password,
            },
            tls: matches!(uri.scheme, AMQPScheme::AMQPS),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// `host:port`, used by backends as the endpoint key.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BrokerAddress::parse(s)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { AMQPS_ADDRESS_PREFIX } else { AMQP_ADDRESS_PREFIX };
        write!(
            f,
            "{}{}:***@{}:{}/{}",
            scheme,
            self.credentials.username,
            self.host,
            self.port,
            self.vhost.replace('/', "%2F")
        )
    }
}
