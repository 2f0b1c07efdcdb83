//! API handlers module

pub mod extraction;
pub mod health;
pub mod live;
