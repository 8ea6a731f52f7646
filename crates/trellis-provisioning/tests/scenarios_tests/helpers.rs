//! Shared harness for provisioning scenarios

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::DynamicObject;
use kube::ResourceExt;

use trellis_common::crd::{
    BootstrapRequest, Cluster, ClusterSpec, ControlPlane, Machine, MachinePool, NodeDeployment,
    ResourceRef, RkeConfig,
};
use trellis_common::labels::SERVICE_ACCOUNT_TOKEN_SECRET_TYPE;
use trellis_common::naming::build_api_resource;
use trellis_common::store::{typed, MemoryStore, ObjectStore};
use trellis_common::Settings;
use trellis_provisioning::bootstrap::{service_account_token, SERVICE_ACCOUNT_TOKEN_KEY};
use trellis_provisioning::cluster::template::MACHINE_CONFIG_API_VERSION;
use trellis_provisioning::planner::record::{
    APPLIED_CHECKSUM_KEY, APPLIED_OUTPUT_KEY, PLAN_CHECKSUM_KEY, PLAN_KEY,
};
use trellis_provisioning::planner::{machine_plan_secret, CAPTURE_ADDRESS_INSTRUCTION};
use trellis_provisioning::planner::plan::NodePlan;
use trellis_provisioning::{bootstrap, cluster, machine_status, nodepool, planner, Context};

pub const NAMESPACE: &str = "default";
pub const CLUSTER: &str = "prod";

/// `etcdctl member list -w json` as the init node reports it
pub const MEMBER_LIST: &str = r#"{"header":{"cluster_id":1},"members":[{"ID":1,"name":"init","peerURLs":["https://10.0.0.5:2380"],"clientURLs":["https://10.0.0.5:2379"]}]}"#;

// =============================================================================
// Test Fixtures
// =============================================================================

/// Pool of etcd + control-plane machines
pub fn server_pool(name: &str, quantity: i32) -> MachinePool {
    MachinePool {
        name: name.into(),
        etcd_role: true,
        control_plane_role: true,
        quantity: Some(quantity),
        node_config: Some(ResourceRef::new("", "DigitaloceanConfig", "nc")),
        ..Default::default()
    }
}

/// Pool of worker machines
pub fn worker_pool(name: &str, quantity: i32) -> MachinePool {
    MachinePool {
        name: name.into(),
        worker_role: true,
        quantity: Some(quantity),
        node_config: Some(ResourceRef::new("", "DigitaloceanConfig", "nc")),
        ..Default::default()
    }
}

/// One provisioning cluster in an in-memory store
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub async fn new(pools: Vec<MachinePool>) -> Self {
        Self::with_settings(pools, Settings::default()).await
    }

    pub async fn with_settings(pools: Vec<MachinePool>, settings: Settings) -> Self {
        let store = Arc::new(MemoryStore::new());

        let api = build_api_resource(MACHINE_CONFIG_API_VERSION, "DigitaloceanConfig");
        let mut config = DynamicObject::new("nc", &api).within(NAMESPACE);
        config.data = serde_json::json!({"region": "nyc3", "size": "s-4vcpu-8gb"});
        store.create(&api, &config).await.unwrap();

        let mut cluster = Cluster::new(
            CLUSTER,
            ClusterSpec {
                kubernetes_version: Some("v1.30.4+rke2r1".into()),
                rke_config: Some(RkeConfig {
                    machine_pools: pools,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some(NAMESPACE.into());
        typed::create(store.as_ref(), &cluster).await.unwrap();

        let ctx = Arc::new(Context::new(store.clone(), settings));
        Self { store, ctx }
    }

    pub fn store(&self) -> &MemoryStore {
        self.store.as_ref()
    }

    pub async fn cluster(&self) -> Cluster {
        typed::get::<Cluster>(self.store(), NAMESPACE, CLUSTER)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn control_plane(&self) -> ControlPlane {
        typed::get::<ControlPlane>(self.store(), NAMESPACE, CLUSTER)
            .await
            .unwrap()
            .unwrap()
    }

    /// Replace the cluster's machine pools
    pub async fn set_pools(&self, pools: Vec<MachinePool>) {
        let mut cluster = self.cluster().await;
        if let Some(rke) = cluster.spec.rke_config.as_mut() {
            rke.machine_pools = pools;
        }
        typed::replace(self.store(), &cluster).await.unwrap();
    }

    // =========================================================================
    // Controllers
    // =========================================================================

    pub async fn reconcile_cluster(&self) -> trellis_provisioning::Result<()> {
        cluster::reconcile(Arc::new(self.cluster().await), self.ctx.clone())
            .await
            .map(|_| ())
    }

    pub async fn reconcile_deployments(&self) {
        for deployment in typed::list::<NodeDeployment>(self.store(), NAMESPACE, "")
            .await
            .unwrap()
        {
            nodepool::reconcile(Arc::new(deployment), self.ctx.clone())
                .await
                .unwrap();
        }
    }

    pub async fn reconcile_requests(&self) {
        for request in typed::list::<BootstrapRequest>(self.store(), NAMESPACE, "")
            .await
            .unwrap()
        {
            bootstrap::reconcile(Arc::new(request), self.ctx.clone())
                .await
                .unwrap();
        }
    }

    pub async fn reconcile_control_plane(&self) {
        planner::reconcile(Arc::new(self.control_plane().await), self.ctx.clone())
            .await
            .unwrap();
    }

    pub async fn reconcile_machines(&self) {
        for machine in self.machines().await {
            machine_status::reconcile(Arc::new(machine), self.ctx.clone())
                .await
                .unwrap();
        }
    }

    /// Stand in for the API server's token controller
    pub async fn issue_tokens(&self) {
        for mut secret in typed::list::<Secret>(self.store(), NAMESPACE, "").await.unwrap() {
            if secret.type_.as_deref() != Some(SERVICE_ACCOUNT_TOKEN_SECRET_TYPE)
                || service_account_token(&secret).is_some()
            {
                continue;
            }
            let token = format!("sa-token-{}", secret.name_any());
            secret.data = Some(BTreeMap::from([(
                SERVICE_ACCOUNT_TOKEN_KEY.to_string(),
                ByteString(token.into_bytes()),
            )]));
            typed::replace(self.store(), &secret).await.unwrap();
        }
    }

    /// One pass of every controller in dependency order
    ///
    /// Machines are reconciled on both sides of the planner so agent reports
    /// are read before plans are computed and new plans show up in status.
    pub async fn converge(&self) {
        self.reconcile_cluster().await.unwrap();
        self.reconcile_deployments().await;
        self.reconcile_requests().await;
        self.issue_tokens().await;
        self.reconcile_requests().await;
        self.reconcile_machines().await;
        self.reconcile_control_plane().await;
        self.reconcile_machines().await;
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn machines(&self) -> Vec<Machine> {
        let mut machines = typed::list::<Machine>(self.store(), NAMESPACE, "")
            .await
            .unwrap();
        machines.sort_by_key(|m| m.name_any());
        machines
    }

    pub async fn machine(&self, name: &str) -> Machine {
        typed::get::<Machine>(self.store(), NAMESPACE, name)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn plan_secret(&self, machine: &Machine) -> Secret {
        typed::get::<Secret>(self.store(), NAMESPACE, &machine_plan_secret(machine))
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn published(&self, machine: &Machine) -> Option<NodePlan> {
        let secret = self.plan_secret(machine).await;
        let raw = secret.data.as_ref()?.get(PLAN_KEY)?;
        Some(NodePlan::decode(&raw.0).unwrap())
    }

    /// Stand in for a node agent applying its published plan
    pub async fn apply_plan(&self, machine: &Machine, capture: Option<&str>) {
        let mut secret = self.plan_secret(machine).await;
        let data = secret.data.get_or_insert_with(BTreeMap::new);
        let checksum = data[PLAN_CHECKSUM_KEY].clone();
        data.insert(APPLIED_CHECKSUM_KEY.to_string(), checksum);
        if let Some(output) = capture {
            let encoded = serde_json::to_string(&BTreeMap::from([(
                CAPTURE_ADDRESS_INSTRUCTION,
                STANDARD.encode(output),
            )]))
            .unwrap();
            data.insert(APPLIED_OUTPUT_KEY.to_string(), ByteString(encoded.into_bytes()));
        }
        typed::replace(self.store(), &secret).await.unwrap();
    }
}
