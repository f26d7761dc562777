//! BIDS conversion orchestration plus sidecar metadata completion and
//! cleaning. The hard imaging work (DICOM parsing, NIfTI conversion,
//! defacing, schema validation) lives in external tools invoked through the
//! [`pipeline`] seams; this crate owns the metadata passes in between.

pub mod clean;
pub mod complete;
pub mod config;
pub mod domain;
pub mod error;
pub mod layout;
pub mod pipeline;
pub mod report;
pub mod sidecar;
pub mod tools;
