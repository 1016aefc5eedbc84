//! Data types shared across tickscope components

pub mod annotation;
pub mod profile;
pub mod tps;
