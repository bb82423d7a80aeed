pub mod correlator;
pub mod signal;

pub use correlator::{
    CorrelationError, CorrelationMode, Correlator, CorrelatorConfig, DelayEstimate, LagEstimate,
};
pub use signal::{normalize, remove_dc, sinc_pulse};
