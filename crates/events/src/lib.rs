//! Event mechanics: the `Event` contract, a pub/sub bus abstraction and an
//! in-memory bus for tests/dev.
//!
//! Concrete events (e.g. stock changes) live in their domain crates.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use tenant::{TenantScoped, tenant_channel};
