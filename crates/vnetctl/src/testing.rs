#![allow(dead_code)]

pub use vnet::{CommandError, Executor, Spawned};

#[path = "../../vnet/tests/common/fake.rs"]
mod fake;

pub use fake::FakeExecutor;
