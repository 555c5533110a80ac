/*!
Delta engine: computing, applying, merging and chaining differences between
whole states.
*/

pub mod binary;
pub mod chain;
pub mod compressor;
pub mod record;

pub use binary::BinaryPatch;
pub use chain::{ChainMetrics, ChainState, DeltaChain};
pub use compressor::{CompressionStats, DeltaCompressor, StrategyFallback};
pub use record::{DeltaInfo, DeltaRecord, DeltaStrategy};
