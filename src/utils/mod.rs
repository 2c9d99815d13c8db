pub use core_pinner::*;
pub use signal_flag::*;
pub use suspension::*;

mod core_pinner;
pub mod logger;
mod signal_flag;
mod suspension;
