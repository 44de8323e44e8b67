//! # Ember Core
//!
//! Dust emission for Monte-Carlo radiative transfer. Given the radiation
//! field absorbed in every spatial cell, this crate computes the normalized
//! emission spectrum of each cell and shares it across the process ensemble.
//!
//! ## Architecture
//!
//! The library engine in [`dustlib`] consumes the collaborator traits of
//! [`system`]; it never owns the physics itself. Reference implementations of
//! those traits live next to it so that a complete model can be run without
//! a radiative transfer code around it.
//!
//! ## Modules
//!
//! - [`system`]: Collaborator traits and physics errors.
//! - [`dustlib`]: Library engine, mapping policies, and emission kernel.
//! - [`grid`]: Tabulated and logarithmic wavelength grids.
//! - [`mix`]: Power-law dust mixes.
//! - [`emissivity`]: Grey-body equilibrium emissivity.
//! - [`medium`]: In-memory dust system.
//! - [`progress`]: Rate-limited progress logging.

pub mod dustlib;
pub mod emissivity;
pub mod grid;
pub mod medium;
pub mod mix;
pub mod progress;
pub mod system;

pub use dustlib::{
    AllCellsLibrary, DustLib, DustLibError, EmissionContext, LibraryMapping, LibraryState,
    LibraryStats, StrengthBinnedLibrary,
};
pub use system::{DustEmissivity, DustMix, DustSystem, PhysicsError, WavelengthGrid};
