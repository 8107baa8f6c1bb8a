pub mod content;
pub mod envelope;
pub mod events;
pub mod launch;
