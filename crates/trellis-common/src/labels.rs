//! Well-known label, annotation and secret type names

/// Provisioning cluster an object belongs to
pub const CLUSTER_NAME_LABEL: &str = "rke.trellis.dev/cluster-name";
/// Node deployment a machine belongs to
pub const DEPLOYMENT_NAME_LABEL: &str = "rke.trellis.dev/deployment-name";
/// Machine a secret or service account serves
pub const MACHINE_NAME_LABEL: &str = "rke.trellis.dev/machine-name";
/// Namespace of the machine a handshake record resolved to
pub const MACHINE_NAMESPACE_LABEL: &str = "rke.trellis.dev/machine-namespace";
/// Hash of a machine's template section, used for rolling updates
pub const TEMPLATE_HASH_LABEL: &str = "rke.trellis.dev/template-hash";

/// Machine runs etcd
pub const ETCD_ROLE_LABEL: &str = "rke.trellis.dev/etcd-role";
/// Machine runs the control plane
pub const CONTROL_PLANE_ROLE_LABEL: &str = "rke.trellis.dev/control-plane-role";
/// Machine runs workloads
pub const WORKER_ROLE_LABEL: &str = "rke.trellis.dev/worker-role";
/// Machine elected to initialize etcd
pub const INIT_NODE_LABEL: &str = "rke.trellis.dev/init-node";

/// Purpose of a service account created for a machine
pub const SERVICE_ACCOUNT_ROLE_LABEL: &str = "rke.trellis.dev/service-account-role";
/// Service account whose token is baked into the install script
pub const ROLE_BOOTSTRAP: &str = "bootstrap";
/// Service account the node agent uses to watch its plan
pub const ROLE_PLAN: &str = "plan";
/// Bootstrap request a service account was created for
pub const BOOTSTRAP_NAME_LABEL: &str = "rke.trellis.dev/bootstrap-name";

/// Index label: hash of the bearer value derived from a service account token
pub const BEARER_HASH_LABEL: &str = "rke.trellis.dev/bearer-hash";
/// Index label: hash of a cluster registration token
pub const REGISTRATION_TOKEN_HASH_LABEL: &str = "rke.trellis.dev/registration-token-hash";

/// Marks handshake records so stale ones can be swept
pub const MACHINE_REQUEST_LABEL: &str = "rke.trellis.dev/machine-request";

/// Join URL captured from the init node, written once
pub const JOIN_URL_ANNOTATION: &str = "rke.trellis.dev/join-url";
/// Node labels for a machine, JSON object
pub const LABELS_ANNOTATION: &str = "rke.trellis.dev/labels";
/// Node taints for a machine, JSON array
pub const TAINTS_ANNOTATION: &str = "rke.trellis.dev/taints";

/// Service account named by a token secret
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
/// UID of the service account a token secret was issued for
pub const SERVICE_ACCOUNT_UID_ANNOTATION: &str = "kubernetes.io/service-account.uid";

/// Secret holding a node's plan
pub const PLAN_SECRET_TYPE: &str = "rke.trellis.dev/machine-plan";
/// Immutable secret holding a node's install script
pub const BOOTSTRAP_SECRET_TYPE: &str = "rke.trellis.dev/bootstrap";
/// Registry credentials
pub const AUTH_CONFIG_SECRET_TYPE: &str = "rke.trellis.dev/auth-config";
/// Handshake record for a node whose identity is not known yet
pub const MACHINE_REQUEST_SECRET_TYPE: &str = "rke.trellis.dev/machine-request";
/// Kubernetes service account token
pub const SERVICE_ACCOUNT_TOKEN_SECRET_TYPE: &str = "kubernetes.io/service-account-token";
/// Kubernetes TLS keypair
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
