//! # fleet-proto
//!
//! Generated Rust code from protobuf definitions for the fleet manager
//! façade, used for communication between:
//! - Fleet clients (CLI, control plane) <-> fleet-daemon (gRPC)

// Include generated code
pub mod generated {
    pub mod fleetmanager {
        pub mod v1 {
            include!("generated/fleetmanager.v1.rs");
        }
    }
}

/// Fleet manager service types and service definitions.
pub mod v1 {
    pub use crate::generated::fleetmanager::v1::*;
    pub use crate::generated::fleetmanager::v1::fleet_manager_service_client::FleetManagerServiceClient;
    pub use crate::generated::fleetmanager::v1::fleet_manager_service_server::{
        FleetManagerService, FleetManagerServiceServer,
    };
}

// Backward compatibility: re-export service types at crate root
pub use generated::fleetmanager::v1::*;
pub use generated::fleetmanager::v1::fleet_manager_service_client::FleetManagerServiceClient;
pub use generated::fleetmanager::v1::fleet_manager_service_server::{
    FleetManagerService, FleetManagerServiceServer,
};
