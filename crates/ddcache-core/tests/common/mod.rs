#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ddcache_core::generated::{
    KvStorage, KvStorageServer, ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};
use ddcache_core::remote::CacheEndpoint;
use ddcache_core::{ClientIdentity, TransferConfig};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::StreamExt;
use tonic::metadata::MetadataMap;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

pub const TOKEN: &str = "test-token";

/// Observable state of the in-memory cache.
#[derive(Default)]
pub struct CacheState {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// Puts to reject with UNAVAILABLE before accepting one.
    pub failing_puts: AtomicU32,
    pub puts: AtomicU32,
    pub last_put_headers: Mutex<HashMap<String, String>>,
    /// Frame size for Get responses.
    pub read_chunk: Mutex<usize>,
}

impl CacheState {
    pub fn blob(&self, resource_name: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(resource_name).cloned()
    }

    pub fn insert(&self, resource_name: &str, data: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(resource_name.to_string(), data.to_vec());
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.last_put_headers.lock().unwrap().get(name).cloned()
    }
}

struct InMemoryKv {
    state: Arc<CacheState>,
}

fn check_auth(metadata: &MetadataMap) -> Result<(), Status> {
    let expected = format!("Bearer {TOKEN}");
    match metadata.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err(Status::unauthenticated("bad token")),
    }
}

fn headers(metadata: &MetadataMap) -> HashMap<String, String> {
    metadata
        .iter()
        .filter_map(|entry| match entry {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => value
                .to_str()
                .ok()
                .map(|value| (key.as_str().to_string(), value.to_string())),
            tonic::metadata::KeyAndValueRef::Binary(..) => None,
        })
        .collect()
}

#[tonic::async_trait]
impl KvStorage for InMemoryKv {
    type GetStream = ReceiverStream<Result<ReadResponse, Status>>;

    async fn get(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::GetStream>, Status> {
        check_auth(request.metadata())?;
        let req = request.into_inner();
        let data = self
            .state
            .blob(&req.resource_name)
            .ok_or_else(|| Status::not_found(format!("{} not found", req.resource_name)))?;
        let chunk = (*self.state.read_chunk.lock().unwrap()).max(1);

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for piece in data.chunks(chunk) {
                let frame = ReadResponse {
                    data: piece.to_vec(),
                };
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn put(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        check_auth(request.metadata())?;
        self.state.puts.fetch_add(1, Ordering::SeqCst);
        let seen = headers(request.metadata());
        *self.state.last_put_headers.lock().unwrap() = seen.clone();

        let failing = self.state.failing_puts.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_puts.store(failing - 1, Ordering::SeqCst);
            return Err(Status::unavailable("try again"));
        }

        let mut stream = request.into_inner();
        let mut resource_name = None::<String>;
        let mut data = Vec::new();
        let mut finished = false;
        while let Some(req) = stream.next().await {
            let req = req?;
            if finished {
                return Err(Status::invalid_argument("write after finish"));
            }
            match &resource_name {
                None => resource_name = Some(req.resource_name.clone()),
                Some(name) if !req.resource_name.is_empty() && *name != req.resource_name => {
                    return Err(Status::invalid_argument("resource name changed"));
                }
                Some(_) => {}
            }
            if req.write_offset != data.len() as i64 {
                return Err(Status::invalid_argument(format!(
                    "offset {} but {} bytes committed",
                    req.write_offset,
                    data.len()
                )));
            }
            data.extend_from_slice(&req.data);
            finished = req.finish_write;
        }
        if !finished {
            return Err(Status::aborted("stream ended without finish_write"));
        }
        let resource_name =
            resource_name.ok_or_else(|| Status::invalid_argument("empty upload"))?;

        let expected = seen
            .get("x-flare-blob-validation-sha256")
            .cloned()
            .unwrap_or_default();
        if !expected.is_empty() {
            let actual = hex::encode(Sha256::digest(&data));
            if actual != expected {
                return Err(Status::invalid_argument(format!(
                    "checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }

        let committed_size = data.len() as i64;
        self.state.insert(&resource_name, &data);
        Ok(Response::new(WriteResponse { committed_size }))
    }
}

pub struct CacheServer {
    pub addr: SocketAddr,
    pub state: Arc<CacheState>,
    handle: JoinHandle<()>,
}

impl CacheServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind cache server");
        let addr = listener.local_addr().expect("listener addr");
        let state = Arc::new(CacheState {
            read_chunk: Mutex::new(64 * 1024),
            ..CacheState::default()
        });
        let service = InMemoryKv {
            state: Arc::clone(&state),
        };
        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(KvStorageServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .expect("cache server");
        });
        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("grpc://{}", self.addr)
    }

    /// A config pointed at this server with short waits.
    pub fn config(&self) -> TransferConfig {
        let endpoint = CacheEndpoint::parse(&self.url()).expect("endpoint");
        let mut config = TransferConfig::new(endpoint, ClientIdentity::new(TOKEN));
        config.retry_wait = Duration::from_millis(10);
        config.spill_backoff = Duration::from_millis(10);
        config.chunk_size = 4096;
        config
    }
}

impl Drop for CacheServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
