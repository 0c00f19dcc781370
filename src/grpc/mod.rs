pub mod cluster_service;
pub mod master_service;
pub mod server;

pub use server::GrpcServer;
