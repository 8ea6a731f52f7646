mod cluster_lifecycle;
mod helpers;
mod node_registration;
