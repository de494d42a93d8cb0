//! fedmesh-core — shared types, wire format, and the algebra/model seams.
//! All other fedmesh crates depend on this one.

pub mod algebra;
pub mod config;
pub mod fragment;
pub mod model;
pub mod wire;

pub use algebra::{CiphertextAlgebra, PlainAlgebra, SharedMaskAlgebra};
pub use model::{FeedForward, Model};
pub use wire::{Envelope, Frame, PacketType, Parameters};
