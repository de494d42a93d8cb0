//! fedmeshd — networked side of fedmesh: UDP endpoint, reliable transport,
//! and the node that wires them to the coordinator and participant roles.

pub mod endpoint;
pub mod node;
pub mod transport;

pub use endpoint::{Endpoint, EndpointError};
pub use node::{Node, NodeError, NodeEvent};
pub use transport::{Inbound, Transport, TransportError};
