mod checksum;
mod compress;

pub use checksum::ChecksumFilter;
pub use compress::CompressionFilter;
