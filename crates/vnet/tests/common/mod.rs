#![allow(dead_code)]

pub use vnet::{CommandError, Executor, Spawned};

mod fake;

pub use fake::FakeExecutor;
