pub mod assignment;
pub mod consumer;
pub mod intake;
pub mod publisher;
pub mod state_machine;
