//! This crate drives model instances with synthetic request groups. It runs
//! every instance on its own worker thread and reports what came back.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod replay;
pub mod synthetic;

pub use replay::{Replayer, Summary};
