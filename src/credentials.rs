//! Client credentials (spec.md §6 "Credentials provider" / "Token-file
//! credentials").
//!
//! Grounded on `examples/original_source/async_grpc/token_file_credentials.cc`'s
//! `OAuthPlugin`: a mutex-guarded cached token plus a refresh deadline,
//! re-reading the file only once the interval has elapsed.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::status::Status;

/// A single outbound call's metadata, to which a [`CredentialsProvider`]
/// attaches headers (spec.md §6 "SetCredentials(client_context)").
#[derive(Default, Debug, Clone)]
pub struct ClientContext {
    metadata: Vec<(String, String)>,
}

impl ClientContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.push((key.into(), value.into()));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.metadata
    }
}

/// Applied by the client immediately before a call (spec.md §6).
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn set_credentials(&self, client_context: &mut ClientContext) -> Result<(), Status>;
}

struct Cache {
    token: String,
    refresh_time: Instant,
}

/// Reads an OAuth bearer token from a flat file, caching it for one
/// `refresh_interval` before re-reading (spec.md §6 "Token-file
/// credentials").
pub struct TokenFileCredentials {
    filename: PathBuf,
    refresh_interval: Duration,
    cache: Mutex<Option<Cache>>,
}

impl TokenFileCredentials {
    pub fn new(filename: impl AsRef<Path>, refresh_interval: Duration) -> Self {
        Self { filename: filename.as_ref().to_path_buf(), refresh_interval, cache: Mutex::new(None) }
    }

    fn token(&self) -> std::io::Result<String> {
        let mut cache = self.cache.lock().unwrap();
        let now = Instant::now();
        let needs_refresh = match &*cache {
            Some(entry) => entry.refresh_time <= now,
            None => true,
        };
        if needs_refresh {
            let token = std::fs::read_to_string(&self.filename)?;
            *cache = Some(Cache { token, refresh_time: now + self.refresh_interval });
        }
        Ok(cache.as_ref().unwrap().token.clone())
    }
}

#[async_trait]
impl CredentialsProvider for TokenFileCredentials {
    async fn set_credentials(&self, client_context: &mut ClientContext) -> Result<(), Status> {
        let token = self
            .token()
            .map_err(|error| Status::internal(format!("failed to read token file: {error}")))?;
        if token.is_empty() {
            return Err(Status::unauthenticated("no authentication token"));
        }
        client_context.set_header("authorization", format!("Bearer {token}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn tempfile_with_contents(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "async_rpc_token_file_credentials_test_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn emits_bearer_header_from_file_contents() {
        let path = tempfile_with_contents("secret-token");
        let creds = TokenFileCredentials::new(&path, Duration::from_secs(60));
        let mut ctx = ClientContext::new();
        creds.set_credentials(&mut ctx).await.expect("should succeed");
        assert_eq!(ctx.headers(), &[("authorization".to_string(), "Bearer secret-token".to_string())]);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn empty_file_is_unauthenticated() {
        let path = tempfile_with_contents("");
        let creds = TokenFileCredentials::new(&path, Duration::from_secs(60));
        let mut ctx = ClientContext::new();
        let err = creds.set_credentials(&mut ctx).await.unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Unauthenticated);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn caches_until_refresh_interval_elapses() {
        let path = tempfile_with_contents("first");
        let creds = TokenFileCredentials::new(&path, Duration::from_millis(20));
        let mut ctx = ClientContext::new();
        creds.set_credentials(&mut ctx).await.unwrap();
        assert_eq!(ctx.headers()[0].1, "Bearer first");

        std::fs::write(&path, "second").unwrap();
        let mut ctx2 = ClientContext::new();
        creds.set_credentials(&mut ctx2).await.unwrap();
        assert_eq!(ctx2.headers()[0].1, "Bearer first", "should still be cached");

        std::thread::sleep(Duration::from_millis(30));
        let mut ctx3 = ClientContext::new();
        creds.set_credentials(&mut ctx3).await.unwrap();
        assert_eq!(ctx3.headers()[0].1, "Bearer second");
        let _ = std::fs::remove_file(&path);
    }
}
