pub mod error;
pub mod mat;
pub mod nn_trait;

pub mod avgpool;
pub mod filter;
pub mod gradient_info;
pub mod head;
pub mod kernel;
pub mod network;

pub mod config;
pub mod optimizer;
pub mod snapshot;
