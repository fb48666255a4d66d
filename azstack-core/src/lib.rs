//! azstack Core
//!
//! Resource model, attribute schemas, per-field differ and the effect
//! interpreter shared by the azstack provider, state and CLI crates.

pub mod differ;
pub mod effect;
pub mod graph;
pub mod interpreter;
pub mod plan;
pub mod provider;
pub mod resource;
pub mod schema;
