//! Fixtures shared by the controller tests

use crate::model::{ClusterPhase, ClusterSpec, ClusterState, RoleRef, TrustPrincipal};
use crate::provider::{
    CloudProvider, CreateClusterRequest, CreateRoleRequest, ProviderClusterStatus,
    SimulatedProvider,
};

pub(crate) async fn role(provider: &SimulatedProvider, name: &str, service: &str) -> RoleRef {
    provider
        .create_role(&CreateRoleRequest {
            name: name.to_string(),
            trust: TrustPrincipal::service(service),
            description: String::new(),
        })
        .await
        .unwrap()
}

/// Create `name` on the simulator and describe it until it is Active
pub(crate) async fn active_cluster(provider: &SimulatedProvider, name: &str) -> ClusterState {
    let svc = role(provider, &format!("{name}-svc"), "eks.amazonaws.com").await;
    let created = provider
        .create_cluster(&CreateClusterRequest {
            name: name.to_string(),
            version: "1.28".to_string(),
            role_arn: svc.arn,
            subnet_ids: vec!["subnet-pub-a".into(), "subnet-pub-b".into()],
            endpoint_public_access: true,
            endpoint_private_access: true,
            authentication_mode: Default::default(),
            bootstrap_cluster_creator_admin_permissions: false,
            client_request_token: format!("{name}-token"),
            tags: Default::default(),
        })
        .await
        .unwrap();

    let desc = loop {
        let desc = provider.describe_cluster(name).await.unwrap();
        if desc.status == ProviderClusterStatus::Active {
            break desc;
        }
    };

    let mut cluster = ClusterState::pending(&ClusterSpec::new(name, "vpc-1", "1.28"), created.arn);
    cluster.transition(ClusterPhase::Creating).unwrap();
    cluster.transition(ClusterPhase::Active).unwrap();
    cluster.set_connection(desc.endpoint, desc.certificate_authority_data);
    cluster
}
