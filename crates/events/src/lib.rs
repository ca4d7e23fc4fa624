//! `stockline-events`: change events and their distribution.
//!
//! Recomputing a row produces facts ("`basic_rate` went from 0 to 3.5"). This
//! crate defines the event contract for those facts and a minimal bus to fan
//! them out to observers.

pub mod bus;
pub mod event;
pub mod field_change;
pub mod in_memory_bus;

pub use bus::{EventBus, Publisher, Subscription};
pub use event::Event;
pub use field_change::FieldChanged;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
