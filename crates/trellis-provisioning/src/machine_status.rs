//! Machine status from agent reports
//!
//! A machine's phase and Provisioned condition follow its bootstrap request
//! and the plan record its agent writes back. The init node's saved etcd
//! member list is turned into the join URL every other node needs; that
//! annotation is written once and never replaced.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use trellis_common::condition::PROVISIONED;
use trellis_common::crd::{BootstrapRequest, ControlPlane, Machine, MachinePhase, MachineStatus};
use trellis_common::labels::JOIN_URL_ANNOTATION;
use trellis_common::store::typed;
use trellis_common::{Error, Result};

use crate::context::{action_for_error, Context};
use crate::planner::record::PlanRecord;
use crate::planner::runtime::Runtime;
use crate::planner::{is_init_node, machine_plan_secret, CAPTURE_ADDRESS_INSTRUCTION};

/// Requeue interval while waiting on the agent
const REPORT_REQUEUE: Duration = Duration::from_secs(10);

/// Join URL from the init node's `etcdctl member list -w json` output
///
/// The first line that parses as a member list wins. The advertised client
/// address is kept and the port swapped for the runtime's supervisor port.
pub fn parse_join_url(output: &[u8], supervisor_port: u16) -> Option<String> {
    let text = String::from_utf8_lossy(output);
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find_map(|doc| {
            let url = doc
                .get("members")?
                .get(0)?
                .get("clientURLs")?
                .get(0)?
                .as_str()?
                .to_string();
            host_of(&url).map(|host| format!("https://{}:{}", host, supervisor_port))
        })
}

fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next()?;
    let host = if authority.starts_with('[') {
        // IPv6 literal keeps its brackets
        authority.split_once(']').map(|(h, _)| &authority[..h.len() + 1])?
    } else {
        authority.split(':').next()?
    };
    (!host.is_empty()).then_some(host)
}

/// Reconcile a machine's status
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    let store = ctx.store.as_ref();
    let namespace = machine.namespace().unwrap_or_default();
    let mut status = machine.status.clone().unwrap_or_default();

    if machine.metadata.deletion_timestamp.is_some() {
        status.phase = MachinePhase::Deleting;
        write_status(&ctx, &machine, status).await?;
        return Ok(Action::await_change());
    }

    let request_name = &machine.spec.bootstrap.config_ref.name;
    if !request_name.is_empty() {
        let request = typed::get::<BootstrapRequest>(store, &namespace, request_name).await?;
        if let Some(data) = request
            .and_then(|r| r.status)
            .and_then(|s| s.data_secret_name)
        {
            status.bootstrap_ready = true;
            status.data_secret_name = Some(data);
            if status.phase == MachinePhase::Pending {
                status.phase = MachinePhase::Provisioning;
            }
        }
    }

    let Some(secret) = typed::get::<Secret>(store, &namespace, &machine_plan_secret(&machine)).await?
    else {
        debug!("plan secret not created yet");
        write_status(&ctx, &machine, status).await?;
        return Ok(Action::requeue(REPORT_REQUEUE));
    };

    let record = match PlanRecord::from_secret(&secret) {
        Ok(record) => record,
        Err(e @ Error::MalformedOutput { .. }) => {
            warn!(error = %e, "agent report unreadable, machine not ready");
            if !PROVISIONED.is_true(&status) {
                PROVISIONED.set_false(&mut status, "MalformedReport", e.to_string());
            }
            write_status(&ctx, &machine, status).await?;
            return Ok(Action::requeue(REPORT_REQUEUE));
        }
        Err(e) => return Err(e),
    };

    let mut current = machine.clone();
    if is_init_node(&machine) && !machine.annotations().contains_key(JOIN_URL_ANNOTATION) {
        if let Some(output) = record.output(CAPTURE_ADDRESS_INSTRUCTION) {
            current = record_join_url(&ctx, &machine, output).await?;
        }
    }

    let threshold = ctx.settings.plan_failure_threshold;
    if record.is_done() {
        if !PROVISIONED.is_true(&status) || status.phase != MachinePhase::Running {
            info!(checksum = %record.plan_checksum, "plan applied");
        }
        status.phase = MachinePhase::Running;
        PROVISIONED.set_true(&mut status, "PlanApplied");
    } else if record.is_failed(threshold) {
        if status.phase != MachinePhase::Failed {
            warn!(failures = record.failure_count, "plan keeps failing");
        }
        status.phase = MachinePhase::Failed;
        PROVISIONED.set_false(
            &mut status,
            "PlanFailed",
            format!("plan failed {} times", record.failure_count),
        );
    } else if record.is_published() {
        // A report for an older checksum is stale: the node is working again
        if status.phase == MachinePhase::Running {
            info!(checksum = %record.plan_checksum, "new plan published, waiting for agent");
            status.phase = MachinePhase::Provisioning;
        }
        PROVISIONED.set_false(&mut status, "Applying", "waiting for the agent to apply its plan");
    }

    let done = record.is_done();
    write_status(&ctx, &current, status).await?;
    Ok(if done {
        Action::await_change()
    } else {
        Action::requeue(REPORT_REQUEUE)
    })
}

/// Decide what to do after a failed reconciliation
pub fn error_policy(machine: Arc<Machine>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(machine = %machine.name_any(), ?error, "machine status update failed");
    action_for_error(error)
}

async fn record_join_url(ctx: &Context, machine: &Arc<Machine>, output: &[u8]) -> Result<Arc<Machine>> {
    let store = ctx.store.as_ref();
    let namespace = machine.namespace().unwrap_or_default();
    let runtime = match typed::get::<ControlPlane>(store, &namespace, &machine.spec.cluster_name).await? {
        Some(cp) => Runtime::for_version(&cp.spec.kubernetes_version),
        None => {
            return Err(Error::not_found(
                "ControlPlane",
                format!("{}/{}", namespace, machine.spec.cluster_name),
            ))
        }
    };

    let Some(url) = parse_join_url(output, runtime.supervisor_port()) else {
        warn!("capture-address output carries no member address");
        return Ok(machine.clone());
    };
    let mut annotated = (**machine).clone();
    annotated
        .annotations_mut()
        .insert(JOIN_URL_ANNOTATION.to_string(), url.clone());
    let annotated = typed::replace(store, &annotated).await?;
    info!(join_url = %url, "recorded join URL");
    Ok(Arc::new(annotated))
}

async fn write_status(ctx: &Context, machine: &Machine, status: MachineStatus) -> Result<()> {
    if machine.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let mut updated = machine.clone();
    updated.status = Some(status);
    typed::replace_status(ctx.store.as_ref(), &updated).await?;
    Ok(())
}
