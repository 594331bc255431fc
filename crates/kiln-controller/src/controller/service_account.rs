//! Workload service accounts
//!
//! Every workload runs under a per-role service account in the object's
//! namespace, annotated with the cloud principal. The principal is bound to
//! the account through SCI before the annotated account is applied, so a pod
//! never starts with an annotation the cloud would reject.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ObjectReference, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use kiln_common::events::{actions, reasons};
use kiln_common::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};

use crate::context::Context;
use crate::ReconcileError;

/// Service account of dataset loader jobs
pub const DATA_LOADER_SERVICE_ACCOUNT: &str = "data-loader";

/// Service account of modeller jobs
pub const MODELLER_SERVICE_ACCOUNT: &str = "modeller";

/// Service account of model server deployments
pub const SERVER_SERVICE_ACCOUNT: &str = "model-server";

/// Service account of notebook pods
pub const NOTEBOOK_SERVICE_ACCOUNT: &str = "notebook";

fn has_annotations(account: &ServiceAccount, wanted: &BTreeMap<String, String>) -> bool {
    let current = account.metadata.annotations.as_ref();
    wanted
        .iter()
        .all(|(k, v)| current.and_then(|a| a.get(k)) == Some(v))
}

/// Make sure `name` exists in `namespace` and is bound to the cloud principal.
///
/// An account that already carries the principal annotations is left alone.
/// Otherwise `BindIdentity` runs first and the account is applied after it
/// succeeds.
pub async fn ensure_service_account(
    ctx: &Context,
    namespace: &str,
    name: &str,
    on_behalf_of: &ObjectReference,
) -> Result<(), ReconcileError> {
    let annotations = ctx.cloud.service_account_annotations();
    if let Some(existing) = ctx.kube.get_service_account(namespace, name).await? {
        if has_annotations(&existing, &annotations) {
            debug!(namespace, service_account = name, "Service account up to date");
            return Ok(());
        }
    }

    if let (Some(principal), false) = (ctx.cloud.principal(), annotations.is_empty()) {
        ctx.sci.bind_identity(principal, namespace, name).await?;
        info!(namespace, service_account = name, principal, "Bound cloud identity");
        ctx.events
            .publish(
                on_behalf_of,
                EventType::Normal,
                reasons::IDENTITY_BOUND,
                actions::BIND,
                Some(format!("Bound {principal} to service account {name}")),
            )
            .await;
    }

    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        ..Default::default()
    };
    ctx.kube.apply_service_account(namespace, &account).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use kiln_build::MockJobClient;
    use kiln_sci::{MockSciClient, SciError};

    use crate::kube_client::MockControllerKubeClient;

    const PRINCIPAL: &str = "kiln-workloads@acme.iam.gserviceaccount.com";

    fn reference() -> ObjectReference {
        ObjectReference {
            kind: Some("Model".to_string()),
            name: Some("llama".to_string()),
            namespace: Some("research".to_string()),
            ..Default::default()
        }
    }

    fn bound_account() -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some("modeller".to_string()),
                annotations: Some(BTreeMap::from([(
                    "iam.gke.io/gcp-service-account".to_string(),
                    PRINCIPAL.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn story_first_binding_calls_sci_before_applying() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut kube = MockControllerKubeClient::new();
        kube.expect_get_service_account().returning(|_, _| Ok(None));
        let applied = order.clone();
        kube.expect_apply_service_account()
            .withf(|namespace, account| {
                namespace == "research"
                    && account
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get("iam.gke.io/gcp-service-account"))
                        .map(String::as_str)
                        == Some(PRINCIPAL)
            })
            .times(1)
            .returning(move |_, _| {
                applied.lock().unwrap().push("apply");
                Ok(())
            });

        let mut sci = MockSciClient::new();
        let bound = order.clone();
        sci.expect_bind_identity()
            .withf(|principal, namespace, account| {
                principal == PRINCIPAL && namespace == "research" && account == "modeller"
            })
            .times(1)
            .returning(move |_, _, _| {
                bound.lock().unwrap().push("bind");
                Ok(())
            });

        let ctx = Context::for_testing(
            Arc::new(kube),
            Arc::new(MockJobClient::new()),
            Arc::new(sci),
        );
        ensure_service_account(&ctx, "research", "modeller", &reference())
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["bind", "apply"]);
    }

    #[tokio::test]
    async fn bound_account_is_left_alone() {
        let mut kube = MockControllerKubeClient::new();
        kube.expect_get_service_account()
            .returning(|_, _| Ok(Some(bound_account())));
        kube.expect_apply_service_account().never();
        let mut sci = MockSciClient::new();
        sci.expect_bind_identity().never();

        let ctx = Context::for_testing(
            Arc::new(kube),
            Arc::new(MockJobClient::new()),
            Arc::new(sci),
        );
        ensure_service_account(&ctx, "research", "modeller", &reference())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_binding_never_applies_the_annotation() {
        let mut kube = MockControllerKubeClient::new();
        kube.expect_get_service_account().returning(|_, _| Ok(None));
        kube.expect_apply_service_account().never();
        let mut sci = MockSciClient::new();
        sci.expect_bind_identity()
            .returning(|_, _, _| Err(SciError::unavailable("gcp", "HTTP 503")));

        let ctx = Context::for_testing(
            Arc::new(kube),
            Arc::new(MockJobClient::new()),
            Arc::new(sci),
        );
        let err = ensure_service_account(&ctx, "research", "modeller", &reference())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
