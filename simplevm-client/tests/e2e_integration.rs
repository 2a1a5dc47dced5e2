//! End-to-end integration test
//!
//! Drives a running simplevm-client through the public RPC surface.
//!
//! Prerequisites:
//! - simplevm-client running on localhost:9090 without TLS
//! - a reachable OpenStack tenancy with an `ubuntu-22.04` image and an
//!   `m1.small` flavor
//! - redis running on the host configured for the daemon
//!
//! Run with: cargo test --test e2e_integration -- --ignored --nocapture

use std::collections::HashMap;
use std::time::Duration;

use tonic::transport::Channel;

use simplevm_client::proto::virtual_machine_service_client::VirtualMachineServiceClient;
use simplevm_client::proto::*;

const ENDPOINT: &str = "http://127.0.0.1:9090";

async fn connect() -> VirtualMachineServiceClient<Channel> {
    let channel = Channel::from_static(ENDPOINT)
        .connect_timeout(Duration::from_secs(5))
        .connect()
        .await
        .expect("Failed to connect to simplevm-client");
    VirtualMachineServiceClient::new(channel)
}

#[tokio::test]
#[ignore]
async fn test_gateway_and_calculation_values() {
    let mut client = connect().await;

    let gateway = client
        .get_gateway_ip(GetGatewayIpRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(!gateway.gateway_ip.is_empty());

    let values = client
        .get_calculation_values(GetCalculationValuesRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(values.ssh_port_calculation.contains('x'));
    assert!(values.udp_port_calculation.contains('x'));
}

#[tokio::test]
#[ignore]
async fn test_image_and_flavor_listings() {
    let mut client = connect().await;

    let images = client.get_images(GetImagesRequest {}).await.unwrap().into_inner();
    assert!(images.images.iter().all(|i| i.status == "active"));
    assert!(images.images.iter().all(|i| !i.tags.is_empty()));

    let flavors = client.get_flavors(GetFlavorsRequest {}).await.unwrap().into_inner();
    assert!(!flavors.flavors.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_plain_vm_start_roundtrip() {
    let mut client = connect().await;

    let servername = format!("e2e-{}", std::process::id());
    let started = client
        .start_server(StartServerRequest {
            flavor_name: "m1.small".to_string(),
            image_name: "ubuntu-22.04".to_string(),
            public_key: "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABgQDe e2e@test".to_string(),
            servername: servername.clone(),
            metadata: HashMap::from([
                ("project_name".to_string(), "e2e".to_string()),
                ("project_id".to_string(), "e2e-project".to_string()),
            ]),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!started.openstack_id.is_empty());

    // The transient keypair is gone right after creation.
    let keypair = client
        .get_keypair_public_key_by_name(GetKeypairPublicKeyByNameRequest {
            key_name: format!("_{servername}_e2e"),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(keypair.public_key.is_empty());

    // Wait for the fixed IP to show up, then the ports are computable.
    let mut ports = None;
    for _ in 0..30 {
        match client
            .get_vm_ports(GetVmPortsRequest {
                openstack_id: started.openstack_id.clone(),
            })
            .await
        {
            Ok(response) => {
                ports = Some(response.into_inner());
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_secs(5)).await,
        }
    }
    let ports = ports.expect("VM never got a fixed IP");
    assert!(ports.port > 0);

    client
        .delete_server(DeleteServerRequest {
            openstack_id: started.openstack_id.clone(),
        })
        .await
        .unwrap();

    // Pollers see the not_found placeholder, not an error.
    let vm = client
        .get_server(GetServerRequest {
            openstack_id: started.openstack_id,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(vm.vm_state == "not_found" || vm.task_state == "deleting");
}
