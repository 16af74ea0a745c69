//! gRPC transport (component L): a `tonic`-generated service exposing
//! §4.7 1:1 as RPC methods. All marshalling between wire DTOs and domain
//! types lives here, never in `fleet-manager` itself (§6).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use futures::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status};

use fleet_manager::{AuthInfo, FleetError, HypervisorFilter, Manager, ProbeStatus};

use fleet_proto::v1::fleet_manager_service_server::FleetManagerService;
use fleet_proto::v1::{
    ChangeMachineTagsRequest, ChangeMachineTagsResponse, GetHypervisorForVmRequest, GetHypervisorForVmResponse,
    GetMachineInfoRequest, GetMachineInfoResponse, GetTopologyRequest, GetTopologyResponse, HypervisorRemovedEvent,
    HypervisorStatusEvent, HypervisorSummary as WireHypervisorSummary, ListHypervisorsInLocationRequest,
    ListHypervisorsInLocationResponse, ListLocationsRequest, ListLocationsResponse, ListVmsInLocationRequest,
    ListVmsInLocationResponse, MachineTagsEvent, MachineInfo as WireMachineInfo, MakeUpdateChannelRequest,
    MoveIpAddressesRequest, MoveIpAddressesResponse, PowerOnMachineRequest, PowerOnMachineResponse, ProbeStatus as WireProbeStatus,
    Snapshot as WireSnapshot, TopologyChangedEvent, UpdateEvent, UpdateTopologyRequest, UpdateTopologyResponse,
    VmEvent, move_ip_addresses_response, update_event,
};

use crate::topology_wire;

pub struct FleetManagerGrpc {
    manager: Arc<Manager>,
}

impl FleetManagerGrpc {
    pub fn new(manager: Arc<Manager>) -> Self {
        FleetManagerGrpc { manager }
    }
}

fn parse_ip(raw: &str) -> Result<Ipv4Addr, Status> {
    Ipv4Addr::from_str(raw).map_err(|_| Status::invalid_argument(format!("invalid ipv4 address: {raw}")))
}

fn fleet_error_to_status(err: FleetError) -> Status {
    match err {
        FleetError::UnknownMachine(_) | FleetError::UnknownVm(_) | FleetError::UnknownLocation(_) => {
            Status::not_found(err.to_string())
        }
        FleetError::InvalidIp(_) => Status::invalid_argument(err.to_string()),
        FleetError::NotOwner => Status::permission_denied(err.to_string()),
        FleetError::NoFreeAddresses(_) | FleetError::InsufficientResources(_) => {
            Status::resource_exhausted(err.to_string())
        }
        FleetError::HypervisorUnreachable(_) | FleetError::StorerIo(_) | FleetError::RpcTimeout => {
            Status::unavailable(err.to_string())
        }
        FleetError::MigrationPrepareFailed(_) | FleetError::MigrationCommitFailed(_) | FleetError::DuplicateIp(_) => {
            Status::aborted(err.to_string())
        }
    }
}

fn probe_status_to_wire(status: ProbeStatus) -> i32 {
    let wire = match status {
        ProbeStatus::NotYetProbed => WireProbeStatus::NotYetProbed,
        ProbeStatus::Connected => WireProbeStatus::Connected,
        ProbeStatus::AccessDenied => WireProbeStatus::AccessDenied,
        ProbeStatus::NoRpc => WireProbeStatus::NoRpc,
        ProbeStatus::NoService => WireProbeStatus::NoService,
        ProbeStatus::ConnectionRefused => WireProbeStatus::ConnectionRefused,
        ProbeStatus::Unreachable => WireProbeStatus::Unreachable,
        ProbeStatus::Off => WireProbeStatus::Off,
    };
    wire as i32
}

fn update_to_wire(update: fleet_manager::notifier::Update) -> UpdateEvent {
    use fleet_manager::notifier::Update;

    let kind = match update {
        Update::Snapshot(snapshot) => update_event::Kind::Snapshot(WireSnapshot {
            hypervisors: snapshot
                .hypervisors
                .into_iter()
                .map(|h| WireHypervisorSummary {
                    hostname: h.hostname,
                    status: probe_status_to_wire(h.status),
                    vm_ips: h.vm_ips.iter().map(Ipv4Addr::to_string).collect(),
                })
                .collect(),
        }),
        Update::VmAdded { hostname, ip } => update_event::Kind::VmAdded(VmEvent {
            hostname,
            ip: ip.to_string(),
        }),
        Update::VmChanged { hostname, ip } => update_event::Kind::VmChanged(VmEvent {
            hostname,
            ip: ip.to_string(),
        }),
        Update::VmDeleted { hostname, ip } => update_event::Kind::VmDeleted(VmEvent {
            hostname,
            ip: ip.to_string(),
        }),
        Update::HypervisorStatusChanged { hostname, status } => {
            update_event::Kind::HypervisorStatusChanged(HypervisorStatusEvent {
                hostname,
                status: probe_status_to_wire(status),
            })
        }
        Update::MachineTagsChanged { hostname, tags } => {
            update_event::Kind::MachineTagsChanged(MachineTagsEvent { hostname, tags })
        }
        Update::HypervisorRemoved { hostname } => {
            update_event::Kind::HypervisorRemoved(HypervisorRemovedEvent { hostname })
        }
        Update::TopologyChanged => update_event::Kind::TopologyChanged(TopologyChangedEvent {}),
    };
    UpdateEvent { kind: Some(kind) }
}

#[tonic::async_trait]
impl FleetManagerService for FleetManagerGrpc {
    type MakeUpdateChannelStream = Pin<Box<dyn Stream<Item = Result<UpdateEvent, Status>> + Send + 'static>>;

    async fn change_machine_tags(
        &self,
        request: Request<ChangeMachineTagsRequest>,
    ) -> Result<Response<ChangeMachineTagsResponse>, Status> {
        let req = request.into_inner();
        let auth = AuthInfo {
            user: req.auth.map(|a| a.user).unwrap_or_default(),
        };
        let tags: BTreeMap<String, String> = req.tags.into_iter().collect();
        self.manager
            .change_machine_tags(&req.hostname, &auth, tags)
            .await
            .map_err(fleet_error_to_status)?;
        Ok(Response::new(ChangeMachineTagsResponse {}))
    }

    async fn get_hypervisor_for_vm(
        &self,
        request: Request<GetHypervisorForVmRequest>,
    ) -> Result<Response<GetHypervisorForVmResponse>, Status> {
        let req = request.into_inner();
        let ip = parse_ip(&req.ip)?;
        let hostname = self.manager.get_hypervisor_for_vm(ip).await.map_err(fleet_error_to_status)?;
        Ok(Response::new(GetHypervisorForVmResponse { hostname }))
    }

    async fn get_machine_info(
        &self,
        request: Request<GetMachineInfoRequest>,
    ) -> Result<Response<GetMachineInfoResponse>, Status> {
        let req = request.into_inner();
        let info = self.manager.get_machine_info(&req.hostname).await.map_err(fleet_error_to_status)?;
        Ok(Response::new(GetMachineInfoResponse {
            info: Some(WireMachineInfo {
                hostname: info.hostname,
                primary_ip: info.primary_ip.to_string(),
                ipmi_ip: info.ipmi_ip.map(|ip| ip.to_string()),
                location: info.location,
                owner_users: info.owner_users.into_iter().collect(),
                tags: info.tags.into_iter().collect(),
                probe_status: probe_status_to_wire(info.probe_status),
                vm_ips: info.vm_ips.iter().map(Ipv4Addr::to_string).collect(),
            }),
        }))
    }

    async fn get_topology(&self, _request: Request<GetTopologyRequest>) -> Result<Response<GetTopologyResponse>, Status> {
        let topology = self.manager.get_topology().await;
        Ok(Response::new(GetTopologyResponse {
            topology: Some(topology_wire::topology_to_wire(&topology)),
        }))
    }

    async fn list_hypervisors_in_location(
        &self,
        request: Request<ListHypervisorsInLocationRequest>,
    ) -> Result<Response<ListHypervisorsInLocationResponse>, Status> {
        let req = request.into_inner();
        let filter = HypervisorFilter {
            connected_only: req.connected_only,
        };
        let hostnames = self.manager.list_hypervisors_in_location(&req.location, filter).await;
        Ok(Response::new(ListHypervisorsInLocationResponse { hostnames }))
    }

    async fn list_locations(&self, request: Request<ListLocationsRequest>) -> Result<Response<ListLocationsResponse>, Status> {
        let req = request.into_inner();
        let locations = self.manager.list_locations(&req.prefix).await;
        Ok(Response::new(ListLocationsResponse { locations }))
    }

    async fn list_vms_in_location(
        &self,
        request: Request<ListVmsInLocationRequest>,
    ) -> Result<Response<ListVmsInLocationResponse>, Status> {
        let req = request.into_inner();
        let ips = self.manager.list_vms_in_location(&req.location).await;
        Ok(Response::new(ListVmsInLocationResponse {
            ips: ips.iter().map(Ipv4Addr::to_string).collect(),
        }))
    }

    async fn make_update_channel(
        &self,
        request: Request<MakeUpdateChannelRequest>,
    ) -> Result<Response<Self::MakeUpdateChannelStream>, Status> {
        let req = request.into_inner();
        let mut receiver = self.manager.make_update_channel(&req.location).await;
        let subscriber_id = receiver.id;
        let manager = self.manager.clone();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(update) = receiver.receiver.recv().await {
                if tx.send(Ok(update_to_wire(update))).is_err() {
                    break;
                }
            }
            manager.close_update_channel(subscriber_id).await;
        });

        let stream = UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::MakeUpdateChannelStream))
    }

    async fn move_ip_addresses(
        &self,
        request: Request<MoveIpAddressesRequest>,
    ) -> Result<Response<MoveIpAddressesResponse>, Status> {
        let req = request.into_inner();
        let ips: Result<Vec<Ipv4Addr>, Status> = req.ips.iter().map(|s| parse_ip(s)).collect();
        let ips = ips?;
        let results = self.manager.move_ip_addresses(&req.target_hostname, ips).await;
        let results = results
            .into_iter()
            .map(|(ip, result)| match result {
                Ok(()) => move_ip_addresses_response::Result {
                    ip: ip.to_string(),
                    ok: true,
                    error: String::new(),
                },
                Err(err) => move_ip_addresses_response::Result {
                    ip: ip.to_string(),
                    ok: false,
                    error: err.to_string(),
                },
            })
            .collect();
        Ok(Response::new(MoveIpAddressesResponse { results }))
    }

    async fn power_on_machine(
        &self,
        request: Request<PowerOnMachineRequest>,
    ) -> Result<Response<PowerOnMachineResponse>, Status> {
        let req = request.into_inner();
        let auth = AuthInfo {
            user: req.auth.map(|a| a.user).unwrap_or_default(),
        };
        self.manager
            .power_on_machine(&req.hostname, &auth)
            .await
            .map_err(fleet_error_to_status)?;
        Ok(Response::new(PowerOnMachineResponse {}))
    }

    async fn update_topology(
        &self,
        request: Request<UpdateTopologyRequest>,
    ) -> Result<Response<UpdateTopologyResponse>, Status> {
        let req = request.into_inner();
        let wire_topology = req
            .topology
            .ok_or_else(|| Status::invalid_argument("topology is required"))?;
        let topology = topology_wire::wire_to_topology(wire_topology).map_err(Status::invalid_argument)?;
        self.manager.update_topology(topology).await;
        Ok(Response::new(UpdateTopologyResponse {}))
    }
}
