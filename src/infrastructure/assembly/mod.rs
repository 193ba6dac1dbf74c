//! Assembly - 结果分片组装与压缩包解包

pub mod archive;
mod assembler;

pub use archive::{unpack_archive, unpack_archive_blocking, UnpackedFile};
pub use assembler::ResultAssembler;
