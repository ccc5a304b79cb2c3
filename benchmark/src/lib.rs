pub mod switch;
pub mod sync_wait;
