//! 流抽象层
//!
//! 把任意后端对象（本地文件、签名 URL、需要并发分片的链接）统一成
//! 可随机访问的字节源。

pub mod error;
pub mod http;
pub mod positioned;
pub mod progress;
pub mod range;
pub mod reader;
pub mod seekable;

pub use error::StreamError;
pub use http::HttpRangeReader;
pub use positioned::{RangeReadReadAtSeeker, SeekerOptions};
pub use progress::{ProgressCallback, ProgressTracker};
pub use range::{parse_content_range, parse_range, sum_ranges_size, ContentRange, HttpRange, RangeParseError};
pub use reader::{copy_with_buffer, read_full, BoxReader, FileRangeReader, RangeReader, SectionReader, SkipLimitReader};
pub use seekable::{ConcurrencyHint, Link, LinkContext, SeekableStream, DEFAULT_PEEK_LIMIT};
