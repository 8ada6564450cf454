use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Request;

use crate::config::ClientIdentity;
use crate::errors::{TransferError, TransferResult};
use crate::generated::{KvStorageClient, ReadRequest, WriteRequest};
use crate::remote::endpoint::CacheEndpoint;
use crate::remote::reader::KvReader;
use crate::remote::session::{Direction, TransferSession};
use crate::remote::writer::{KvWriter, WRITE_QUEUE_DEPTH};

/// Parameters of one upload.
#[derive(Debug, Clone, Default)]
pub struct PutParams {
    /// Logical key; the client name is prepended to form the resource name.
    pub key: String,
    /// Lowercase hex SHA-256 the server validates the blob against, if known.
    pub sha256: Option<String>,
}

/// A connected key/value cache client bound to one identity.
#[derive(Clone)]
pub struct KvClient {
    inner: KvStorageClient<Channel>,
    identity: ClientIdentity,
}

impl KvClient {
    /// Dials `endpoint`, giving up after `dial_timeout`.
    pub async fn connect(
        endpoint: &CacheEndpoint,
        identity: ClientIdentity,
        dial_timeout: Duration,
    ) -> TransferResult<Self> {
        debug!("creating client for {}", endpoint.authority());

        let mut builder = Endpoint::from_shared(endpoint.channel_uri())
            .map_err(|err| {
                TransferError::invalid_endpoint(format!("building channel for {endpoint}"))
                    .with_source(err)
            })?
            .connect_timeout(dial_timeout);
        if endpoint.tls {
            let tls = ClientTlsConfig::new()
                .domain_name(endpoint.host.clone())
                .with_native_roots();
            builder = builder.tls_config(tls).map_err(|err| {
                TransferError::transport(format!("configuring TLS for {endpoint}"))
                    .with_source(err)
                    .fatal()
            })?;
        }

        let channel = match tokio::time::timeout(dial_timeout, builder.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(err)) => {
                return Err(
                    TransferError::transport(format!("dial {}: {err}", endpoint.authority()))
                        .with_source(err),
                )
            }
            Err(_) => {
                return Err(TransferError::transport(format!(
                    "dial {}: timed out after {:?}",
                    endpoint.authority(),
                    dial_timeout
                )))
            }
        };

        Ok(Self::from_channel(channel, identity))
    }

    pub fn from_channel(channel: Channel, identity: ClientIdentity) -> Self {
        Self {
            inner: KvStorageClient::new(channel),
            identity,
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Opens an upload stream for `params.key`. The call runs in its own task;
    /// the returned writer feeds it chunk by chunk.
    pub fn start_put(&self, params: PutParams) -> TransferResult<KvWriter> {
        let session = TransferSession::new(&self.identity, &params.key, Direction::Upload);
        let metadata = session.metadata(params.sha256.as_deref())?;

        let (tx, rx) = mpsc::channel::<WriteRequest>(WRITE_QUEUE_DEPTH);
        let mut request = Request::new(ReceiverStream::new(rx));
        *request.metadata_mut() = metadata;

        let mut client = self.inner.clone();
        let call = tokio::spawn(async move {
            client
                .put(request)
                .await
                .map(tonic::Response::into_inner)
        });

        debug!("stream initialized: {}", params.key);
        Ok(KvWriter::new(session.resource_name().to_string(), tx, call))
    }

    /// Opens a download stream for the whole of `key`.
    pub async fn start_get(&self, key: &str) -> TransferResult<KvReader> {
        let session = TransferSession::new(&self.identity, key, Direction::Download);
        let mut request = Request::new(ReadRequest {
            resource_name: session.resource_name().to_string(),
            read_offset: 0,
            read_limit: 0,
        });
        *request.metadata_mut() = session.metadata(None)?;

        let mut client = self.inner.clone();
        let stream = client
            .get(request)
            .await
            .map_err(|status| {
                TransferError::from_status("initiate get", session.resource_name(), status)
            })?
            .into_inner();

        debug!("stream initialized: {}", key);
        Ok(KvReader::new(session.resource_name(), stream))
    }
}
