//! Rate limiting logic and state management.

mod backend;
pub mod clock;
pub mod hook;
pub mod key;
mod limiter;
pub mod policy;
pub mod window;

pub use backend::{WindowEntry, WindowStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use hook::{LockoutEvent, LockoutHook};
pub use key::WindowKey;
pub use limiter::{Limiter, LimiterBuilder, Outcome};
pub use policy::{Policy, PolicyConfig, PolicyRegistry, PolicyRegistryBuilder};
pub use window::{Decision, EntryTicket};
