pub mod cleanup;
pub mod sync;
