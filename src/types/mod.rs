pub mod endpoint;
pub mod events;
pub mod presence;
pub mod signal;
