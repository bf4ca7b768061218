use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::host::network::NetworkStack;
use crate::host::socket_layer::{SocketLayer, SocketLayerConfig, Transport};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl From<u32> for NodeId {
    fn from(i: u32) -> Self {
        NodeId(i)
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable information about the node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub hostname: String,
    /// The partition (emulation process) that owns this node.
    pub partition: u32,
}

/// An emulated node: its identity and the virtual sockets opened on it.
pub struct Node {
    // Store immutable info in an Arc, that we can safely clone into the logger.
    info: Arc<NodeInfo>,
    sockets: SocketLayer,
}

impl Node {
    pub fn new(
        info: NodeInfo,
        network: NetworkStack,
        transport: Rc<dyn Transport>,
        config: SocketLayerConfig,
    ) -> Self {
        let sockets = SocketLayer::new(info.id, network, transport, config);
        Self {
            info: Arc::new(info),
            sockets,
        }
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn hostname(&self) -> &str {
        &self.info.hostname
    }

    pub fn partition(&self) -> u32 {
        self.info.partition
    }

    pub fn info(&self) -> &Arc<NodeInfo> {
        &self.info
    }

    pub fn sockets(&self) -> &SocketLayer {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut SocketLayer {
        &mut self.sockets
    }

    pub fn network(&self) -> &NetworkStack {
        self.sockets.network()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("info", &self.info)
            .field("open_sockets", &self.sockets.num_open())
            .finish_non_exhaustive()
    }
}
