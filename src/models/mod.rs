pub mod claims;
pub mod order;
pub mod patch;
