use serde::{Deserialize, Serialize};

/// Configuration for a call's peer connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN/TURN server URLs for NAT traversal.
    pub ice_servers: Vec<IceServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:global.stun.twilio.com:3478"),
            ],
        }
    }
}

impl CallConfig {
    /// Configuration without any ICE servers, for same-host tests.
    pub fn localhost() -> Self {
        Self { ice_servers: vec![] }
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls,
            username: String::new(),
            credential: String::new(),
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls,
            username,
            credential,
        });
        self
    }
}

impl IceServerConfig {
    fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: String::new(),
            credential: String::new(),
        }
    }
}
