//! gRPC module for billing-engine.

mod service;

pub use service::BillingEngineServiceImpl;

/// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("billing.engine.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("billing_engine_descriptor");
}
