pub mod cleanup;
pub mod common;
pub mod conflicts;
pub mod health;
pub mod status;
pub mod sync;
