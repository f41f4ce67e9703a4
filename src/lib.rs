#![recursion_limit = "256"]
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod rng;
pub mod scheduler;
pub mod training;
pub mod utils;

pub use error::{Result, StackGanError};
