mod addr;
mod methods;
mod reply;

pub use addr::Addr;
pub use addr::AddressType;
pub use addr::SocksSocketAddr;
pub use methods::AuthMethod;
pub use reply::Reply;

pub const VERSION: u8 = 0x05;
pub const RESERVED: u8 = 0x00;

/// The only request command transocks issues.
pub const CMD_CONNECT: u8 = 0x01;
