mod addr;
mod wait;

pub use addr::{get_unused_addr, get_unused_addrs};
pub use wait::wait_for;
