pub mod discv4;
pub mod host;
pub mod rlpx;
pub mod utils;
