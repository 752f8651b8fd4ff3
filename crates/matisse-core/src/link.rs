//! Serialized request/response link to the instrument.
//!
//! The Matisse protocol has no multiplexing: a response belongs to whichever
//! command was sent last. [`InstrumentLink`] therefore owns its [`Transport`]
//! behind a single async mutex, and every exchange happens inside a
//! [`LinkSession`] holding that mutex. A rejected command and its
//! `ERROR:CODE?` follow-up are issued under the same session so no other
//! task can slip a query in between.
//!
//! Callers that must update cached state only after the instrument confirms a
//! command keep the session alive across the command and the update.

use crate::error::{MatisseError, MatisseResult};
use crate::protocol::{self, ERROR_CLEAR, ERROR_CODE_QUERY};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Byte-level transport for one command/response exchange.
///
/// Implementations send `command` with whatever terminator the physical link
/// needs and return the trimmed response line.
#[async_trait]
pub trait Transport: Send {
    /// Send one command and wait for its response.
    async fn exchange(&mut self, command: &str) -> anyhow::Result<String>;

    /// Short description for log output (port name, "simulated", ...).
    fn describe(&self) -> String;
}

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Shared handle to the instrument. Cloning yields another handle to the
/// same serialized transport.
#[derive(Clone)]
pub struct InstrumentLink {
    transport: SharedTransport,
    description: Arc<str>,
}

impl InstrumentLink {
    /// Wrap a transport without touching the instrument.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let description: Arc<str> = transport.describe().into();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            description,
        }
    }

    /// Wrap a transport and clear latent error state with `ERROR:CLEAR`.
    ///
    /// Any failure here means the instrument cannot be trusted and is
    /// reported as [`MatisseError::LinkUnavailable`].
    pub async fn open(transport: Box<dyn Transport>) -> MatisseResult<Self> {
        let link = Self::new(transport);
        link.command(ERROR_CLEAR)
            .await
            .map_err(|e| MatisseError::LinkUnavailable(e.to_string()))?;
        info!("Connected to Matisse via {}", link.description);
        Ok(link)
    }

    /// Description of the underlying transport.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Acquire exclusive use of the link.
    pub async fn session(&self) -> LinkSession<'_> {
        LinkSession {
            transport: self.transport.lock().await,
        }
    }

    /// Send a command and return its (checked) response.
    pub async fn query(&self, command: &str) -> MatisseResult<String> {
        self.session().await.query(command).await
    }

    /// Send a command and discard the acknowledgement.
    pub async fn command(&self, command: &str) -> MatisseResult<()> {
        self.session().await.command(command).await
    }

    /// Query a floating point parameter (`"SPZT:NOW"` reads `SPZT:NOW?`).
    pub async fn read_f64(&self, parameter: &str) -> MatisseResult<f64> {
        self.session().await.read_f64(parameter).await
    }

    /// Query an integer parameter.
    pub async fn read_i64(&self, parameter: &str) -> MatisseResult<i64> {
        self.session().await.read_i64(parameter).await
    }

    /// Query a boolean status parameter.
    pub async fn read_bool(&self, parameter: &str) -> MatisseResult<bool> {
        self.session().await.read_bool(parameter).await
    }
}

impl std::fmt::Debug for InstrumentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentLink")
            .field("transport", &self.description)
            .finish()
    }
}

/// Exclusive access to the instrument for a sequence of exchanges.
pub struct LinkSession<'a> {
    transport: MutexGuard<'a, Box<dyn Transport>>,
}

impl LinkSession<'_> {
    async fn exchange(&mut self, command: &str) -> MatisseResult<String> {
        let response = self
            .transport
            .exchange(command)
            .await
            .map_err(|e| MatisseError::communication(command, e))?;
        debug!(command, response = %response, "Matisse exchange");
        Ok(response)
    }

    /// Send a command; on the error sentinel, fetch the error code and fail.
    pub async fn query(&mut self, command: &str) -> MatisseResult<String> {
        let response = self.exchange(command).await?;
        if protocol::is_error_response(&response) {
            let code = match self.exchange(ERROR_CODE_QUERY).await {
                Ok(code) => code,
                Err(e) => format!("{} (error code unavailable: {})", response, e),
            };
            return Err(MatisseError::CommandRejected {
                command: command.to_string(),
                code,
            });
        }
        Ok(response)
    }

    /// Send a command and discard the acknowledgement.
    pub async fn command(&mut self, command: &str) -> MatisseResult<()> {
        self.query(command).await.map(|_| ())
    }

    /// Query a floating point parameter.
    pub async fn read_f64(&mut self, parameter: &str) -> MatisseResult<f64> {
        let command = protocol::query(parameter);
        let response = self.query(&command).await?;
        protocol::parse_f64(&response).ok_or_else(|| MatisseError::malformed(&command, &response))
    }

    /// Query an integer parameter.
    pub async fn read_i64(&mut self, parameter: &str) -> MatisseResult<i64> {
        let command = protocol::query(parameter);
        let response = self.query(&command).await?;
        protocol::parse_i64(&response).ok_or_else(|| MatisseError::malformed(&command, &response))
    }

    /// Query a boolean status parameter.
    pub async fn read_bool(&mut self, parameter: &str) -> MatisseResult<bool> {
        let command = protocol::query(parameter);
        let response = self.query(&command).await?;
        protocol::parse_bool(&response).ok_or_else(|| MatisseError::malformed(&command, &response))
    }
}
