use tonic::metadata::{MetadataMap, MetadataValue};

use crate::config::ClientIdentity;
use crate::errors::{TransferError, TransferResult};

const AUTHORIZATION: &str = "authorization";
const ORG_ID: &str = "x-org-id";
const VALIDATION_SHA256: &str = "x-flare-blob-validation-sha256";
const VALIDATION_LEVEL: &str = "x-flare-blob-validation-level";
const NO_SKIP_DUPLICATE_WRITES: &str = "x-flare-no-skip-duplicate-writes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// One logical transfer against one remote resource.
#[derive(Debug, Clone)]
pub struct TransferSession {
    resource_name: String,
    direction: Direction,
    identity: ClientIdentity,
}

impl TransferSession {
    pub fn new(identity: &ClientIdentity, key: &str, direction: Direction) -> Self {
        Self {
            resource_name: identity.resource_name(key),
            direction,
            identity: identity.clone(),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Request metadata for this session. Uploads additionally ask the server to
    /// validate the blob against `sha256` (empty disables the check) and to never
    /// skip a write it believes is a duplicate.
    pub fn metadata(&self, sha256: Option<&str>) -> TransferResult<MetadataMap> {
        let mut metadata = MetadataMap::new();
        metadata.insert(
            AUTHORIZATION,
            ascii_value(&format!("Bearer {}", self.identity.token))?,
        );
        metadata.insert(ORG_ID, ascii_value(&self.identity.org_id)?);

        if self.direction == Direction::Upload {
            metadata.insert(VALIDATION_SHA256, ascii_value(sha256.unwrap_or(""))?);
            metadata.insert(VALIDATION_LEVEL, MetadataValue::from_static("error"));
            metadata.insert(NO_SKIP_DUPLICATE_WRITES, MetadataValue::from_static("true"));
        }
        Ok(metadata)
    }
}

fn ascii_value(raw: &str) -> TransferResult<MetadataValue<tonic::metadata::Ascii>> {
    MetadataValue::try_from(raw).map_err(|err| {
        TransferError::invalid_config("request metadata is not valid ASCII").with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn identity() -> ClientIdentity {
        ClientIdentity {
            client_name: "kv".into(),
            org_id: "org-1".into(),
            token: "secret".into(),
        }
    }

    #[test]
    fn upload_metadata_carries_validation_headers() {
        let session = TransferSession::new(&identity(), "main-archive-stream", Direction::Upload);
        assert_eq!(session.resource_name(), "kv/main-archive-stream");

        let md = session.metadata(Some("abc123")).unwrap();
        assert_eq!(md.get(AUTHORIZATION).unwrap(), "Bearer secret");
        assert_eq!(md.get(ORG_ID).unwrap(), "org-1");
        assert_eq!(md.get(VALIDATION_SHA256).unwrap(), "abc123");
        assert_eq!(md.get(VALIDATION_LEVEL).unwrap(), "error");
        assert_eq!(md.get(NO_SKIP_DUPLICATE_WRITES).unwrap(), "true");
    }

    #[test]
    fn missing_checksum_sends_empty_header() {
        let session = TransferSession::new(&identity(), "k", Direction::Upload);
        let md = session.metadata(None).unwrap();
        assert_eq!(md.get(VALIDATION_SHA256).unwrap(), "");
    }

    #[test]
    fn download_metadata_is_auth_only() {
        let session = TransferSession::new(&identity(), "k", Direction::Download);
        let md = session.metadata(None).unwrap();
        assert!(md.get(AUTHORIZATION).is_some());
        assert!(md.get(VALIDATION_SHA256).is_none());
    }

    #[test]
    fn non_ascii_identity_is_a_config_error() {
        let mut id = identity();
        id.token = "tok\u{e9}n\n".into();
        let session = TransferSession::new(&id, "k", Direction::Download);
        let err = session.metadata(None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
        assert!(err.should_abort());

        let mut id = identity();
        id.org_id = "org\u{e9}".into();
        let session = TransferSession::new(&id, "k", Direction::Upload);
        let err = session.metadata(Some("abc")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }
}
