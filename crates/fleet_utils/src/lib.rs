pub mod error;
pub mod exit;
pub mod log_assert;
pub mod poll;
pub mod shutdown;
