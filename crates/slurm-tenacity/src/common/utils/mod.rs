pub mod runtime;
pub mod str;
pub mod time;
