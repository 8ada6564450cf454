pub mod archive;
pub mod checksum;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod remote;
pub mod retry;
pub mod transfer;

pub use config::{ClientIdentity, TransferConfig};
pub use errors::{ErrorCategory, ErrorKind, TransferError, TransferResult};

pub mod generated {
    pub mod google {
        pub mod bytestream {
            tonic::include_proto!("google.bytestream");
        }
    }

    pub mod kv_storage {
        tonic::include_proto!("kv_storage");
    }

    pub use google::bytestream::{ReadRequest, ReadResponse, WriteRequest, WriteResponse};
    pub use kv_storage::kv_storage_client::KvStorageClient;
    pub use kv_storage::kv_storage_server::{KvStorage, KvStorageServer};
}
