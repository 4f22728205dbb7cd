pub mod active;
pub mod admission;
pub mod allocator;
pub mod autostart;
pub mod clock;
pub mod context;
pub mod engine;
pub mod instances;
pub mod lock;
pub mod outbound;
pub mod pipeline;
pub mod redis_storage;
pub mod registry;
pub mod start;
pub mod storage;
pub mod sync;
pub mod update;

pub use engine::{Hub, HubBuilder, Outcome};
