pub mod codec;
pub mod error;
pub mod node;
pub mod raft;
pub mod session;
pub mod space;
pub mod store;
pub mod tuple;
pub mod worker;

pub use codec::CodecError;
pub use error::Error;
pub use node::{Node, NodeConfig};
pub use space::SpaceHandle;
pub use store::TupleSpace;
pub use tuple::{Element, Tuple};
