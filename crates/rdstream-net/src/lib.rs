pub mod conn;
pub mod dialer;
pub mod error;

pub use conn::Conn;
pub use dialer::{DialContext, Dialer};
pub use error::NetError;
