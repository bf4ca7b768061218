pub mod network;
pub mod node;
pub mod socket_layer;
