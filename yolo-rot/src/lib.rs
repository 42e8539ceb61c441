//! Rotated-box YOLO detection head and its training loss.

mod common;

pub mod anchor;
pub mod layer;
pub mod loss;
pub mod target;

pub use anchor::*;
pub use layer::*;
pub use loss::*;
pub use target::*;
