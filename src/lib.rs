pub mod node;
pub mod peers;
pub mod store;
pub mod transport;
pub mod types;
pub mod wire;

pub use node::{MeshNode, NodeConfig, NodeStatus};
pub use store::CrdtStore;
pub use types::{ChangeKind, MeshEvents, NoEvents, NodeId};
