pub mod address;

pub use address::{Address, AddressParseError, AddressType};
