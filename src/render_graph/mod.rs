//! Render Graph System
//!
//! A declarative description of a frame: render targets, subgraphs (each
//! compiled into one renderpass) and the passes inside them (subpasses).
//! The executor turns the description into native objects and records it
//! every frame.

pub mod compiler;
pub mod executor;
pub mod graph;
pub mod pass;
pub mod resource;

pub use executor::*;
pub use graph::*;
pub use pass::*;
pub use resource::*;
