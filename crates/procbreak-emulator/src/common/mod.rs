pub mod breakpoint;
pub mod memory;
pub mod session;
pub mod thread;
