//! # metaquant-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`MetaQuantConfig`]**: experiment hyper-parameters (serialised as JSON).
//! * **[`MetaMethod`]** / **[`QuantScheme`]** / **[`ModelKind`]**: closed
//!   choice sets, parsed once at load time.
//! * **[`CifarDataset`]** / **[`SyntheticDataset`]**: image batches behind
//!   the [`BatchDataset`] trait.
//! * **[`batch_to_tensors`]**: raw batch → Candle tensors.

pub mod config;
pub mod data;

pub use config::{
    MetaMethod, MetaNetConfig, MetaNonlinear, MetaQuantConfig, ModelKind, QuantScheme,
};
pub use data::{
    batch_to_tensors, AnyImageDataset, BatchDataset, CifarDataset, CifarVariant, ImageBatch,
    Split, SyntheticDataset,
};
