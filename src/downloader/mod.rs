pub mod chunk;
pub mod engine;

pub use chunk::{Chunk, ChunkManager, DEFAULT_CHUNK_SIZE};
pub use engine::{ChunkDownloader, ChunkedReader, DownloaderConfig, HttpPartFetcher, PartFetcher};
