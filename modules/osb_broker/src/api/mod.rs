//! OSBAPI REST surface.

pub mod rest;

pub use rest::routes::router;
