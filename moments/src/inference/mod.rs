//! Clients for the remote inference services reached through tunnels.

pub mod client;
pub mod parse;
pub mod prompts;
pub mod types;

pub use client::{InferenceClient, InferenceConfig};
pub use types::*;
