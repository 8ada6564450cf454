pub mod client;
pub mod endpoint;
pub mod reader;
pub mod session;
pub mod writer;

pub use client::{KvClient, PutParams};
pub use endpoint::CacheEndpoint;
pub use reader::KvReader;
pub use session::{Direction, TransferSession};
pub use writer::KvWriter;
