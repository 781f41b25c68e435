//! Output surfaces: the compressed update stream, the heavy-hitter report,
//! and operational metrics.

pub mod health;
#[cfg(feature = "thresholding")]
pub mod threshold;
pub mod update;
