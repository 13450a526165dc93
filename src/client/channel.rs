//! Client channel (spec.md §6 "Credentials provider" / §4.9).
//!
//! Grounded on `examples/original_source/async_grpc/channel.h`: a channel
//! bundles the call destination with an optional credentials provider,
//! applied to a fresh [`ClientContext`] immediately before every call.
//! There is no separate SSL/plaintext distinction here — transport security
//! is a property of the [`crate::transport::Dialer`] implementation, not of
//! this type.

use std::sync::Arc;

use crate::credentials::{ClientContext, CredentialsProvider};
use crate::status::Status;
use crate::transport::Dialer;

/// The client-side handle to one destination. Cheaply `Clone`, shared by
/// every `Client`/`AsyncClient` built against it.
#[derive(Clone)]
pub struct Channel {
    dialer: Arc<dyn Dialer>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
}

impl Channel {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer, credentials: None }
    }

    pub fn with_credentials(dialer: Arc<dyn Dialer>, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self { dialer, credentials: Some(credentials) }
    }

    pub(crate) fn dialer(&self) -> Arc<dyn Dialer> {
        self.dialer.clone()
    }

    /// Builds a fresh [`ClientContext`] and applies credentials to it
    /// (spec.md §6 "SetCredentials(client_context) applied by the client
    /// immediately before a call").
    pub(crate) async fn client_context(&self) -> Result<ClientContext, Status> {
        let mut context = ClientContext::new();
        if let Some(provider) = &self.credentials {
            provider.set_credentials(&mut context).await?;
        }
        Ok(context)
    }
}
