/// Account models for multi-protocol mailbox harvesting
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MailProtocol {
    #[default]
    Imap,
    Pop3,
    Exchange,
    WebSession,
}

impl MailProtocol {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "imap" => Some(Self::Imap),
            "pop3" => Some(Self::Pop3),
            "exchange" => Some(Self::Exchange),
            "websession" => Some(Self::WebSession),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imap => "imap",
            Self::Pop3 => "pop3",
            Self::Exchange => "exchange",
            Self::WebSession => "websession",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
    Syncing,
    Error,
    Invalid,
}

impl ConnectionStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "disconnected" => Some(Self::Disconnected),
            "connected" => Some(Self::Connected),
            "syncing" => Some(Self::Syncing),
            "error" => Some(Self::Error),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Syncing => "syncing",
            Self::Error => "error",
            Self::Invalid => "invalid",
        }
    }
}

/// Credential bundle for a mailbox. Exactly one variant is stored per account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Credentials {
    Password {
        password: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        access_token: String,
        refresh_token: Option<String>,
    },
    Cookies {
        cookies: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub protocol: MailProtocol,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Base URL for REST-style protocols (exchange, websession)
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub credentials_encrypted: String,
    pub status: ConnectionStatus,
    pub proxy_id: Option<String>,
    pub last_sync_ts: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,

    // Decoded credential bundle, populated on demand
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl Account {
    /// Generate account ID from email
    pub fn generate_id(email: &str) -> String {
        format!("acc_{}", email.replace('@', "_").replace('.', "_"))
    }

    /// Encode a credential bundle into the storage column (base64 over JSON)
    pub fn encode_credentials(credentials: &Credentials) -> Result<String> {
        use base64::Engine;
        let json = serde_json::to_vec(credentials)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Decode the storage column back into a credential bundle
    pub fn decode_credentials(encoded: &str) -> Result<Credentials> {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        Ok(serde_json::from_slice(&decoded)?)
    }

    /// Load account with the decoded credential bundle populated
    pub fn with_credentials(mut self) -> Result<Self> {
        let credentials = Self::decode_credentials(&self.credentials_encrypted)?;
        self.credentials = Some(credentials);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_round_trip() {
        let creds = Credentials::Password {
            password: "hunter2".into(),
        };
        let encoded = Account::encode_credentials(&creds).unwrap();
        assert_eq!(Account::decode_credentials(&encoded).unwrap(), creds);

        let creds = Credentials::OAuth2 {
            access_token: "ya29.token".into(),
            refresh_token: Some("1//refresh".into()),
        };
        let encoded = Account::encode_credentials(&creds).unwrap();
        assert_eq!(Account::decode_credentials(&encoded).unwrap(), creds);
    }

    #[test]
    fn protocol_round_trip() {
        for p in [
            MailProtocol::Imap,
            MailProtocol::Pop3,
            MailProtocol::Exchange,
            MailProtocol::WebSession,
        ] {
            assert_eq!(MailProtocol::from_str(p.as_str()), Some(p));
        }
        assert_eq!(MailProtocol::from_str("smtp"), None);
    }

    #[test]
    fn generate_id_is_stable() {
        assert_eq!(
            Account::generate_id("user@example.com"),
            "acc_user_example_com"
        );
    }
}
