pub mod codec;
pub mod compress;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod message;
pub mod reply;
pub mod serialize;

pub use codec::*;
pub use compress::*;
pub use context::*;
pub use error::*;
pub use interceptor::*;
pub use message::*;
pub use reply::*;
pub use serialize::*;
