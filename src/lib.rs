#![warn(clippy::all, rust_2018_idioms)]

pub mod annotation;
pub mod attrs;
pub mod commands;
pub mod downsample;
pub mod error;
pub mod manifest;
pub mod multiscale;
pub mod ome;
pub mod pool;
pub mod reader;
pub mod storage;

pub use error::{Error, Result};
