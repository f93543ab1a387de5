#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

//! Constrained decoding by Lagrangian optimization over a relaxed token
//! representation.
//!
//! A primary loss is minimized subject to `loss_i <= eps_i` constraints from
//! other differentiable scorers, with a damped primal-dual update per step.

pub mod config;
pub mod data;
pub mod decode;
pub mod error;
pub mod lagrangian;
pub mod model;
pub mod optim;
pub mod schedule;
pub mod scoring;
pub mod setup;
pub mod target;
pub mod tokenizer;
pub mod weights;

pub use config::{DecodeConfig, DecodePlan};
pub use decode::{CancelFlag, Decoder};
pub use error::{ConfigError, DecodeError, Result};
