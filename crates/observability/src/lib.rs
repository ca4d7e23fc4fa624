//! Tracing setup shared by stockline binaries and tests.

mod subscriber;

pub use subscriber::{init, init_for_tests};
