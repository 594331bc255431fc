//! Server reconciler
//!
//! A Server serves a ready Model through a Deployment and Service named
//! `{name}-server` on port 8080, with the model's artifacts mounted read-only
//! at `/content/saved-model`. The Server registers itself in the Model's
//! `status.servers`.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tracing::{debug, info, instrument};

use kiln_common::crd::{condition_reasons, condition_types, Model, Server, ServerStatus};
use kiln_common::naming::deterministic_hash;
use kiln_common::{owner_labels, ArtifactObject, ObjectKind, SERVER_PORT};
use kiln_resources::{Role, SizingRequest};

use crate::context::Context;
use crate::index::ObjectKey;
use crate::ReconcileError;

use super::jobs::{dependent_name, generation_annotations};
use super::service_account::{ensure_service_account, SERVER_SERVICE_ACCOUNT};
use super::workload::{WorkloadPod, SAVED_MODEL_PATH};
use super::{
    artifacts_url, gate, object_key, object_namespace, owner_reference, report_invalid,
    resolve_image, set_condition, ImageResolution,
};

/// Annotation holding a hash of the spec a Deployment or Service was applied with
pub const SPEC_HASH_ANNOTATION: &str = "kiln.dev/spec-hash";

/// Name of the Deployment and Service of a Server
pub fn server_resource_name(name: &str) -> String {
    dependent_name(name, "server")
}

/// Reconcile a Server
#[instrument(skip(server, ctx), fields(server = %server.name_any()))]
pub async fn reconcile(server: Arc<Server>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = server.name_any();
    let namespace = object_namespace(server.as_ref())?;

    let original = server.status.clone().unwrap_or_default();
    let mut status = original.clone();
    let result = drive(&server, &ctx, &namespace, &mut status).await;

    if status != original {
        debug!(ready = status.common.ready, "Writing server status");
        ctx.kube
            .patch_server_status(&namespace, &name, &status)
            .await?;
    }
    result
}

async fn drive(
    server: &Server,
    ctx: &Context,
    namespace: &str,
    status: &mut ServerStatus,
) -> Result<Action, ReconcileError> {
    let name = server.name_any();
    let model_name = &server.spec.model.name;
    let workload = &server.spec.workload;

    ctx.index.record(
        &object_key(server, namespace),
        [ObjectKey::new(ObjectKind::Model, namespace, model_name)],
    );

    if let Err(e) = workload.validate(&server.object_key()) {
        return Ok(report_invalid(
            ctx,
            server,
            &mut status.common,
            condition_types::SERVING,
            e.to_string(),
        )
        .await);
    }

    let image = match resolve_image(ctx, server, namespace, &mut status.common).await? {
        ImageResolution::Ready(image) => image,
        ImageResolution::Pending(action) => return Ok(action),
    };

    ensure_service_account(ctx, namespace, SERVER_SERVICE_ACCOUNT, &server.object_ref(&()))
        .await?;

    let model = match ctx.kube.get_model(namespace, model_name).await? {
        None => {
            return Ok(gate(
                server,
                &mut status.common,
                condition_types::SERVING,
                condition_reasons::MODEL_NOT_FOUND,
                format!("Model {model_name} not found"),
            ))
        }
        Some(model) if !model.is_ready() => {
            return Ok(gate(
                server,
                &mut status.common,
                condition_types::SERVING,
                condition_reasons::MODEL_NOT_READY,
                format!("Model {model_name} is not ready"),
            ))
        }
        Some(model) => model,
    };

    register_with_model(ctx, namespace, &model, &name).await?;

    let plan = match ctx.sizer.plan(
        SizingRequest::new(Role::Server)
            .with_size(model.spec.size)
            .with_overrides(workload.resources.as_ref()),
    ) {
        Ok(plan) => plan,
        Err(e) => {
            return Ok(report_invalid(
                ctx,
                server,
                &mut status.common,
                condition_types::SERVING,
                e.to_string(),
            )
            .await)
        }
    };

    let model_artifacts = artifacts_url(
        &ctx.cloud,
        ObjectKind::Model,
        namespace,
        model_name,
        model.status.as_ref().and_then(|s| s.artifacts.as_ref()),
    );
    let pod = WorkloadPod::new(
        &ctx.cloud,
        ObjectKind::Server,
        &name,
        &image,
        workload,
        SERVER_SERVICE_ACCOUNT,
    )
    .owner_uid(server.uid().as_deref())
    .mount("saved-model", model_artifacts, SAVED_MODEL_PATH, true)
    .port("http", SERVER_PORT)
    .resources(&plan);

    let resource_name = server_resource_name(&name);
    let owner = owner_reference(server)?;
    let selector = owner_labels(ObjectKind::Server, &name);

    let deployment_spec = DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(selector.clone()),
            ..Default::default()
        },
        template: pod.into_template(),
        ..Default::default()
    };
    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(resource_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector.clone()),
            annotations: Some(stamped(server, &deployment_spec)?),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(deployment_spec),
        ..Default::default()
    };
    let service_spec = ServiceSpec {
        selector: Some(selector.clone()),
        ports: Some(vec![ServicePort {
            name: Some("http".to_string()),
            port: i32::from(SERVER_PORT),
            target_port: Some(IntOrString::Int(i32::from(SERVER_PORT))),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };
    let service = Service {
        metadata: ObjectMeta {
            name: Some(resource_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector),
            annotations: Some(stamped(server, &service_spec)?),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(service_spec),
        ..Default::default()
    };

    let live = match ctx.kube.get_deployment(namespace, &resource_name).await? {
        Some(live) if is_current(&live.metadata, &deployment.metadata) => live,
        _ => {
            debug!(deployment = %resource_name, "Applying deployment");
            ctx.kube.apply_deployment(namespace, &deployment).await?
        }
    };
    match ctx.kube.get_service(namespace, &resource_name).await? {
        Some(live) if is_current(&live.metadata, &service.metadata) => {}
        _ => {
            debug!(service = %resource_name, "Applying service");
            ctx.kube.apply_service(namespace, &service).await?;
        }
    }

    let ready_replicas = live
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let ready = ready_replicas >= 1;
    let generation = server.meta().generation;
    if ready {
        set_condition(
            &mut status.common,
            condition_types::SERVING,
            true,
            condition_reasons::DEPLOYMENT_READY,
            format!("Deployment {resource_name} has {ready_replicas} ready replicas"),
            generation,
        );
    } else {
        set_condition(
            &mut status.common,
            condition_types::SERVING,
            false,
            condition_reasons::DEPLOYMENT_NOT_READY,
            format!("Deployment {resource_name} has no ready replicas"),
            generation,
        );
    }
    if status.common.ready != ready {
        info!(ready, deployment = %resource_name, "Server readiness changed");
    }
    status.common.ready = ready;
    Ok(Action::await_change())
}

/// Generation annotations plus a hash of `spec`
fn stamped<T: Serialize>(
    server: &Server,
    spec: &T,
) -> Result<BTreeMap<String, String>, ReconcileError> {
    let json = serde_json::to_string(spec)
        .map_err(|e| kiln_common::Error::serialization_for_kind("Server", e.to_string()))?;
    let mut annotations = generation_annotations(server);
    annotations.insert(SPEC_HASH_ANNOTATION.to_string(), deterministic_hash(&json, 16));
    Ok(annotations)
}

/// Whether the live object was applied with the desired spec
fn is_current(live: &ObjectMeta, desired: &ObjectMeta) -> bool {
    let hash = |meta: &ObjectMeta| {
        meta.annotations
            .as_ref()
            .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
            .cloned()
    };
    hash(live).is_some() && hash(live) == hash(desired)
}

/// Add `server` to the Model's `status.servers`. The Model reconciler prunes
/// entries whose Server is gone.
async fn register_with_model(
    ctx: &Context,
    namespace: &str,
    model: &Model,
    server: &str,
) -> Result<(), ReconcileError> {
    let mut model_status = model.status.clone().unwrap_or_default();
    if model_status.register_server(server) {
        debug!(model = %model.name_any(), server, "Registering server with model");
        ctx.kube
            .patch_model_servers(namespace, &model.name_any(), &model_status.servers)
            .await?;
    }
    Ok(())
}
