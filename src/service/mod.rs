// =============================================================================
// Matrixon Matrix NextServer - Service Module
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
//   Service wiring for the protocol core. The embedding server constructs
//   Services once at startup and threads it through its request handlers.
//
// =============================================================================

pub mod globals;
pub mod pdu;
pub mod rooms;

use std::sync::Arc;

use crate::{config::Config, crypto::Ed25519KeyPair, Result};

/// The constructed protocol core services.
pub struct Services {
    pub globals: Arc<globals::Service>,
}

impl Services {
    /// Build the services with the production federation key fetcher.
    pub fn build(
        config: Config,
        keypair: Ed25519KeyPair,
        db: Arc<dyn globals::Data>,
    ) -> Result<Self> {
        Ok(Self {
            globals: Arc::new(globals::Service::load(config, keypair, db)?),
        })
    }

    /// Build the services with a custom key fetcher (tests, proxies).
    pub fn with_fetcher(
        config: Config,
        keypair: Ed25519KeyPair,
        db: Arc<dyn globals::Data>,
        fetcher: Arc<dyn globals::KeyFetcher>,
    ) -> Self {
        Self {
            globals: Arc::new(globals::Service::with_fetcher(config, keypair, db, fetcher)),
        }
    }
}
