#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod bids;
pub mod config;
mod core;
pub mod data;
pub mod engine;
mod error;
pub mod external;
pub mod pipeline;
pub mod study;
mod subject;
mod utils;

pub use crate::config::Config;
pub use crate::core::{ArcStr, Dynamic, Fingerprint};
pub use crate::engine::{Diagnostics, Plan, Session, TaskStatus, Variants};
pub use crate::error::*;
pub use crate::external::Toolkit;
pub use crate::study::{Study, SubjectRun};
pub use crate::subject::Subses;
pub use crate::utils::{init_logging, sidecar_path};
