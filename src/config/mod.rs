// =============================================================================
// Matrixon Matrix NextServer - Protocol Config Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Configuration injected into the protocol core at construction. The core
//   exposes no ambient configuration; the embedding server deserializes this
//   from its own config file and hands it over together with the signing
//   keypair.
//
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{identifiers::ServerName, Error, Result};

fn default_federation_timeout_s() -> u64 {
    10
}

fn default_own_key_validity_s() -> u64 {
    7 * 86400
}

/// Protocol core configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// The canonical name of this server, as it appears in user IDs and in
    /// the `destination` field of inbound federation requests.
    pub server_name: ServerName,

    /// Timeout applied to every outbound federation key fetch.
    #[serde(default = "default_federation_timeout_s")]
    pub federation_timeout_s: u64,

    /// Servers whose notary key responses we accept as a fallback source.
    #[serde(default)]
    pub trusted_servers: Vec<ServerName>,

    /// How long our own published key document claims validity for.
    #[serde(default = "default_own_key_validity_s")]
    pub own_key_validity_s: u64,
}

impl Config {
    /// Build a config with defaults for everything but the server name.
    pub fn new(server_name: ServerName) -> Self {
        Self {
            server_name,
            federation_timeout_s: default_federation_timeout_s(),
            trusted_servers: Vec::new(),
            own_key_validity_s: default_own_key_validity_s(),
        }
    }

    /// Validate the configuration before the services are constructed.
    pub fn validate(&self) -> Result<()> {
        debug!("🔍 Validating protocol core configuration");

        if self.federation_timeout_s == 0 {
            return Err(Error::bad_config("Federation timeout must be greater than 0"));
        }
        if self.own_key_validity_s == 0 {
            return Err(Error::bad_config("Own key validity must be greater than 0"));
        }

        debug!("✅ Protocol core configuration validation passed");
        Ok(())
    }

    pub fn federation_timeout(&self) -> Duration {
        Duration::from_secs(self.federation_timeout_s)
    }

    pub fn own_key_validity(&self) -> Duration {
        Duration::from_secs(self.own_key_validity_s)
    }
}
