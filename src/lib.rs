//! Atomic display commit engine for KMS outputs.
//!
//! The crate is split along the commit path: [`registry`] tracks the
//! device's connectors, crtcs and planes, [`framebuffer`] refcounts
//! framebuffer objects, [`state`] models per-output plane state as
//! copy-on-write snapshots, [`transaction`] turns a snapshot diff into
//! one atomic property request, and [`engine`] drives the whole cycle
//! from repaint scheduling to page-flip completion. [`hw`] is the seam
//! to the device; everything above it is hardware-agnostic.

pub mod config;
pub mod engine;
pub mod error;
pub mod framebuffer;
pub mod geometry;
pub mod hotplug;
pub mod hw;
pub mod registry;
pub mod scene;
pub mod scheduler;
pub mod state;
pub mod transaction;

pub use config::Config;
pub use engine::{DisplayEngine, Renderer};
pub use error::{Error, Result};
