//! Build bot data models.

pub mod build;
