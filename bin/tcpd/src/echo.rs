//! The echo application.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::{BufMut as _, Bytes, BytesMut};
use serde::Deserialize;
use tcpd_config::ConfigurationLoader;
use tcpd_core::{Application, TcpConnection};
use tcpd_error::{ErrorContext as _, GenericError};
use tracing::debug;

/// Echo application configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EchoConfiguration {
    /// Bytes written before every echoed payload.
    #[serde(default)]
    pub prefix: String,
}

impl EchoConfiguration {
    /// Loads the configuration from the given YAML file and `TCPD_ECHO_`-prefixed environment variables.
    ///
    /// A missing file is treated as empty.
    pub fn from_file(path: &Path) -> Result<Self, GenericError> {
        let mut loader = ConfigurationLoader::default();
        if path.is_file() {
            loader = loader
                .from_yaml(path)
                .with_error_context(|| format!("Failed to load application configuration from '{}'.", path.display()))?;
        } else {
            debug!(path = %path.display(), "Application configuration file not found. Using defaults.");
        }

        loader
            .from_environment("TCPD_ECHO")
            .error_context("Failed to read application configuration from the environment.")?
            .into_typed()
            .error_context("Failed to parse application configuration.")
    }
}

/// Writes every received payload back to its connection.
pub struct EchoApplication {
    prefix: Bytes,
}

impl EchoApplication {
    /// Creates a new `EchoApplication` from its configuration.
    pub fn new(config: EchoConfiguration) -> Self {
        Self {
            prefix: Bytes::from(config.prefix),
        }
    }

    /// Creates the application for a process from its configuration file.
    pub fn from_config_file(path: &Path) -> Result<Arc<dyn Application>, GenericError> {
        let config = EchoConfiguration::from_file(path)?;
        Ok(Arc::new(Self::new(config)))
    }

    fn reply(&self, data: Bytes) -> Bytes {
        if self.prefix.is_empty() {
            return data;
        }

        let mut reply = BytesMut::with_capacity(self.prefix.len() + data.len());
        reply.put_slice(&self.prefix);
        reply.put_slice(&data);
        reply.freeze()
    }
}

#[async_trait]
impl Application for EchoApplication {
    async fn run_connect(&self, connection: &TcpConnection) -> Result<(), GenericError> {
        debug!(fd = %connection.id(), reactor_id = connection.reactor_id(), "Client connected.");
        Ok(())
    }

    async fn run_receive(&self, connection: &TcpConnection, data: Bytes) -> Result<(), GenericError> {
        connection.send(self.reply(data))
    }

    async fn run_close(&self, connection: &TcpConnection) -> Result<(), GenericError> {
        debug!(fd = %connection.id(), "Client disconnected.");
        Ok(())
    }

    fn clean_components(&self) -> Result<(), GenericError> {
        Ok(())
    }
}
