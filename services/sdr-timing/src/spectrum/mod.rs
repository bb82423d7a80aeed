//! Power spectrum estimation and waterfall history

mod pipeline;
mod waterfall;

pub use pipeline::{AveragingMode, SpectralRow, SpectrumConfig, SpectrumError, SpectrumPipeline};
pub use waterfall::WaterfallBuffer;
