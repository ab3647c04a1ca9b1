//! Nimbus Core
//!
//! Core library for the Nimbus provider: resource model, schemas, planning,
//! and the waiting and retrying primitives every resource handler builds on

pub mod differ;
pub mod effect;
pub mod interpreter;
pub mod plan;
pub mod provider;
pub mod reference;
pub mod resource;
pub mod retry;
pub mod schema;
pub mod wait;
