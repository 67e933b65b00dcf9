//! Block-level delta machinery: rolling weak hash, the sliding-window
//! buffer, the block-signature producer and the delta generator.

pub mod checksum;
pub mod generator;
pub mod rolling;
pub mod window;

pub use checksum::{block_sums, file_block_sums};
pub use generator::{index_sums, send_new_file, send_partial, IndexedSum, SumIndex};
pub use rolling::{adler32, Adler32};
pub use window::Bring;
