mod arena;
mod error;
mod layout;
mod platform;

pub use arena::{MemArena, allocation_granularity};
pub use error::{ArenaError, ArenaResult};
pub use layout::{MappedLayout, MappedView, ViewLayout, ViewSpec};
