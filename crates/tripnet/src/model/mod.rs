//! Embedding network and the tensor bridge between pool data and burn tensors.

pub mod bridge;
pub mod embedding_net;
