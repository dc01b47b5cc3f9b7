mod swap;

pub use swap::SwapWriter;
