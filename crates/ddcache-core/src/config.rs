use std::fmt;
use std::time::Duration;

use crate::remote::CacheEndpoint;

pub const DEFAULT_CLIENT_NAME: &str = "kv";
pub const DEFAULT_ORG_ID: &str = "dbd227a0aeb70859";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(5);
/// Payload size of one upload chunk; well below gRPC's 4 MiB message cap.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_SPILL_BUFFER: usize = 1024 * 1024;
pub const DEFAULT_SPILL_BACKOFF: Duration = Duration::from_secs(1);

/// Who is talking to the cache. Sent with every request and used to namespace
/// resource names as `{client_name}/{key}`.
#[derive(Clone)]
pub struct ClientIdentity {
    pub client_name: String,
    pub org_id: String,
    pub token: String,
}

impl ClientIdentity {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            org_id: DEFAULT_ORG_ID.to_string(),
            token: token.into(),
        }
    }

    pub fn resource_name(&self, key: &str) -> String {
        format!("{}/{}", self.client_name, key)
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_name", &self.client_name)
            .field("org_id", &self.org_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Everything one save or restore invocation needs to reach the cache.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub endpoint: CacheEndpoint,
    pub identity: ClientIdentity,
    pub dial_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_wait: Duration,
    pub chunk_size: usize,
    pub spill_buffer: usize,
    pub spill_backoff: Duration,
}

impl TransferConfig {
    pub fn new(endpoint: CacheEndpoint, identity: ClientIdentity) -> Self {
        Self {
            endpoint,
            identity,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_wait: DEFAULT_RETRY_WAIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            spill_buffer: DEFAULT_SPILL_BUFFER,
            spill_backoff: DEFAULT_SPILL_BACKOFF,
        }
    }

    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy::new(self.retry_attempts, self.retry_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_are_namespaced_by_client() {
        let mut identity = ClientIdentity::new("token");
        assert_eq!(identity.resource_name("main-archive-stream"), "kv/main-archive-stream");

        identity.client_name = "ci".into();
        assert_eq!(identity.resource_name("main-metadata-stream"), "ci/main-metadata-stream");
    }

    #[test]
    fn debug_output_hides_the_token() {
        let identity = ClientIdentity::new("s3cr3t-bearer");
        let endpoint = CacheEndpoint::parse("grpc://localhost:6666").unwrap();
        let config = TransferConfig::new(endpoint, identity.clone());
        for rendered in [format!("{identity:?}"), format!("{config:?}")] {
            assert!(!rendered.contains("s3cr3t-bearer"), "{rendered}");
            assert!(rendered.contains("<redacted>"));
        }
    }
}
