//! the test_utils folder here will share fixtures and fake collaborators
//! between unit tests of different modules
mod common;
mod environment;

pub use common::*;
pub use environment::*;
