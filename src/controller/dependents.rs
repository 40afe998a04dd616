//! Dependents of an Elasticsearch database
//!
//! Each `ensure_*` brings one group of offshoots to the desired state and
//! reports a [`Verb`]. They run in a fixed order: secrets the pods mount,
//! services, RBAC, then the node StatefulSets.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::probe::{sleep_or_cancel, wait_for_first_pod};
use crate::crd::{CertificateAlias, Elasticsearch};
use crate::resources::certificate::{
    self, CertificateAuthority, ROOT_CERT, ROOT_KEY, TLS_CERT, alias_secret_name, cert_secret_name,
};
use crate::resources::common::{
    FIELD_MANAGER, Verb, create_if_absent, create_or_patch, database_selector, decide_verb,
    delete_if_exists, offshoot_labels, selector_string,
};
use crate::resources::monitor::{generate_service_monitor, service_monitor_resource};
use crate::resources::secret::{
    self, CONFIG_FILE, INTERNAL_USERS_FILE, SecurityDns, auth_secret_name, config_secret_name,
    has_key, is_owned_by, secret_value,
};
use crate::resources::service::{self, master_service_name, stats_service_name};
use crate::resources::statefulset::{
    NodeGroup, WorkloadSettings, generate_statefulset, node_groups, required_aliases,
    uses_certificates,
};
use crate::resources::rbac;

/// What `ensure` did, split the way the reconciler reports it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub services: Verb,
    pub workloads: Verb,
}

impl EnsureOutcome {
    pub fn overall(&self) -> Verb {
        Verb::compose(&[self.services, self.workloads])
    }
}

fn namespace(es: &Elasticsearch) -> Result<String> {
    es.namespace().ok_or(Error::MissingObjectKey("namespace"))
}

/// Record a generated secret name in the spec so it survives a halt
async fn bind_secret_name(ctx: &Context, es: &Elasticsearch, field: &str, name: &str) -> Result<()> {
    let api: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), &namespace(es)?);
    let patch = json!({ "spec": { field: { "secretName": name } } });
    api.patch(&es.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(field, secret = name, "bound generated secret");
    Ok(())
}

/// Adopt the user's auth secret or generate one with random passwords
pub async fn ensure_auth_secret(ctx: &Context, es: &Elasticsearch) -> Result<Verb> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace(es)?);
    let verb = create_if_absent(&api, &secret::generate_auth_secret(es)).await?;
    if es.spec.auth_secret.is_none() {
        bind_secret_name(ctx, es, "authSecret", &auth_secret_name(es)).await?;
    }
    Ok(verb)
}

/// Root CA of the bundle, or `None` when the bundle carries no signing key
fn bundle_authority(bundle: &Secret) -> Result<Option<CertificateAuthority>> {
    match (secret_value(bundle, ROOT_CERT), secret_value(bundle, ROOT_KEY)) {
        (Some(cert), Some(key)) => Ok(Some(CertificateAuthority::from_pem(&cert, &key)?)),
        _ => Ok(None),
    }
}

/// Bundle secret plus one secret per TLS alias the nodes mount
pub async fn ensure_certificates(ctx: &Context, es: &Elasticsearch) -> Result<Verb> {
    if !uses_certificates(es) {
        return Ok(Verb::Unchanged);
    }
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace(es)?);
    let governing = ctx.config.governing_service.as_str();

    let bundle_name = cert_secret_name(es);
    let (bundle, bundle_verb) = match api.get_opt(&bundle_name).await? {
        Some(existing) => (existing, Verb::Unchanged),
        None => {
            let desired = certificate::bundle_secret(es, certificate::generate_bundle(es, governing)?);
            let verb = create_if_absent(&api, &desired).await?;
            (desired, verb)
        }
    };
    if es.spec.certificate_secret.is_none() {
        bind_secret_name(ctx, es, "certificateSecret", &bundle_name).await?;
    }

    let mut verbs = vec![bundle_verb];
    let mut authority = None;
    for alias in required_aliases(es) {
        let name = alias_secret_name(es, alias);
        let user_supplied = es
            .spec
            .tls
            .as_ref()
            .and_then(|tls| tls.certificate(alias))
            .is_some_and(|c| c.secret_name.is_some());
        if api.get_opt(&name).await?.is_some() {
            verbs.push(Verb::Unchanged);
            continue;
        }
        if user_supplied {
            return Err(Error::NotFound(format!("certificate secret {name} for alias {alias}")));
        }
        if authority.is_none() {
            authority = bundle_authority(&bundle)?;
        }
        let ca = authority.as_ref().ok_or_else(|| {
            Error::CertificateError(format!(
                "secret {bundle_name} has no {ROOT_KEY}; cannot issue the {alias} certificate"
            ))
        })?;
        let data = certificate::generate_alias(es, ca, alias, governing)?;
        verbs.push(create_if_absent(&api, &certificate::alias_secret(es, alias, data)).await?);
    }
    Ok(Verb::compose(&verbs))
}

async fn alias_subject(
    api: &Api<Secret>,
    es: &Elasticsearch,
    alias: CertificateAlias,
) -> Result<Option<String>> {
    let Some(secret) = api.get_opt(&alias_secret_name(es, alias)).await? else {
        return Ok(None);
    };
    secret_value(&secret, TLS_CERT)
        .map(|pem| certificate::subject_dn(pem.as_bytes()))
        .transpose()
}

/// Subject DNs of the transport and admin certificates, when HTTPS is on
async fn security_dns(api: &Api<Secret>, es: &Elasticsearch) -> Result<SecurityDns> {
    if !es.spec.enable_ssl || es.spec.disable_security {
        return Ok(SecurityDns::default());
    }
    Ok(SecurityDns {
        nodes_dn: alias_subject(api, es, CertificateAlias::Transport).await?,
        admin_dn: alias_subject(api, es, CertificateAlias::Admin).await?,
    })
}

/// `elasticsearch.yml` and the internal users file
///
/// A secret this database already owns keeps its data; only labels are
/// synced. A secret owned by someone else is used as is.
pub async fn ensure_config_secret(ctx: &Context, es: &Elasticsearch) -> Result<Verb> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace(es)?);
    let name = config_secret_name(es);

    if let Some(existing) = api.get_opt(&name).await? {
        if !is_owned_by(&existing, es) {
            return Ok(Verb::Unchanged);
        }
        if !has_key(&existing, CONFIG_FILE) {
            return Err(Error::InvalidConfig(format!(
                "{CONFIG_FILE} is missing in secret {name}"
            )));
        }
        let labels = offshoot_labels(&es.name_any());
        let synced = labels
            .iter()
            .all(|(k, v)| existing.labels().get(k) == Some(v));
        if synced {
            return Ok(Verb::Unchanged);
        }
        let patch = json!({ "metadata": { "labels": labels } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        return Ok(Verb::Patched);
    }

    let dns = security_dns(&api, es).await?;
    let mut data = BTreeMap::from([(CONFIG_FILE.to_string(), secret::elasticsearch_yml(es, &dns))]);
    if es.security_enabled() {
        let auth = api.get_opt(&auth_secret_name(es)).await?;
        let passwords = secret::user_passwords(es, auth.as_ref());
        data.insert(
            INTERNAL_USERS_FILE.to_string(),
            secret::internal_users_yml(es, &passwords)?,
        );
    }
    create_if_absent(&api, &secret::generate_config_secret(es, data)).await
}

/// Headless service shared by every database in the namespace
pub async fn ensure_governing_service(ctx: &Context, es: &Elasticsearch) -> Result<Verb> {
    let ns = namespace(es)?;
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);
    let desired = service::generate_governing_service(&ctx.config.governing_service, &ns);
    create_if_absent(&api, &desired).await
}

/// Client, master and (for Prometheus monitors) stats services
pub async fn ensure_services(ctx: &Context, es: &Elasticsearch) -> Result<Verb> {
    let name = es.name_any();
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace(es)?);

    let mut verbs = vec![
        create_or_patch(&api, &service::generate_client_service(es), Some(&name)).await?,
        create_or_patch(&api, &service::generate_master_service(es), Some(&name)).await?,
    ];
    match service::generate_stats_service(es) {
        Some(stats) => verbs.push(create_or_patch(&api, &stats, Some(&name)).await?),
        None => {
            if delete_if_exists(&api, &stats_service_name(es)).await? {
                debug!(service = %stats_service_name(es), "removed stats service");
            }
        }
    }
    Ok(Verb::compose(&verbs))
}

/// ServiceAccount, Role and RoleBinding the node pods run as
pub async fn ensure_rbac(ctx: &Context, es: &Elasticsearch) -> Result<Verb> {
    if !ctx.config.enable_rbac {
        return Ok(Verb::Unchanged);
    }
    let ns = namespace(es)?;
    let name = es.name_any();
    let accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &ns);
    let roles: Api<Role> = Api::namespaced(ctx.client.clone(), &ns);
    let bindings: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), &ns);
    Ok(Verb::compose(&[
        create_or_patch(&accounts, &rbac::generate_service_account(es), Some(&name)).await?,
        create_or_patch(&roles, &rbac::generate_role(es), Some(&name)).await?,
        create_or_patch(&bindings, &rbac::generate_role_binding(es), Some(&name)).await?,
    ]))
}

/// A changed group with no replicas never gets a `-0` pod to wait for
fn awaits_first_pod(group: &NodeGroup, verb: Verb) -> bool {
    verb != Verb::Unchanged && group.replicas > 0
}

/// One StatefulSet per node group; waits for the first pod of changed groups
pub async fn ensure_workloads(ctx: &Context, es: &Elasticsearch) -> Result<Verb> {
    let ns = namespace(es)?;
    let name = es.name_any();
    let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
    let record = ctx.lookup.version(&es.spec.version).await?;
    let images = ctx.config.images(&es.spec.version, record.as_ref());
    let settings = WorkloadSettings {
        governing_service: &ctx.config.governing_service,
        enable_rbac: ctx.config.enable_rbac,
        images: &images,
    };

    let mut verbs = Vec::new();
    for group in node_groups(es) {
        let desired = generate_statefulset(es, &group, &settings);
        let verb = create_or_patch(&api, &desired, Some(&name)).await?;
        if awaits_first_pod(&group, verb) {
            let waited = wait_for_first_pod(
                ctx.probe.as_ref(),
                &ns,
                &group.name,
                ctx.config.pod_ready_timeout(),
                ctx.config.pod_poll_interval(),
                &ctx.shutdown,
            )
            .await;
            if let Err(e) = waited {
                if !matches!(e, Error::Cancelled(_)) {
                    ctx.warning(
                        es,
                        reasons::FAILED_TO_START,
                        actions::CREATE,
                        format!("Failed to start StatefulSet {}: {e}", group.name),
                    )
                    .await;
                }
                return Err(e);
            }
        }
        info!(statefulset = %group.name, %verb, "node group ensured");
        verbs.push(verb);
    }
    Ok(Verb::compose(&verbs))
}

/// Everything the nodes need, in dependency order
pub async fn ensure(ctx: &Context, es: &Elasticsearch) -> Result<EnsureOutcome> {
    ensure_auth_secret(ctx, es).await?;
    ensure_certificates(ctx, es).await?;
    ensure_config_secret(ctx, es).await?;

    if let Err(e) = ensure_governing_service(ctx, es).await {
        ctx.warning(
            es,
            reasons::FAILED_TO_CREATE,
            actions::CREATE,
            format!(
                "Failed to create governing service {}: {e}",
                ctx.config.governing_service
            ),
        )
        .await;
        return Err(e);
    }
    let services = ensure_services(ctx, es).await?;

    ensure_rbac(ctx, es).await?;
    let workloads = ensure_workloads(ctx, es).await?;

    Ok(EnsureOutcome {
        services,
        workloads,
    })
}

/// Give the nodes time to find each other after a workload change
pub async fn wait_for_formation(ctx: &Context) -> Result<()> {
    sleep_or_cancel(ctx.config.formation_wait(), &ctx.shutdown).await
}

fn service_monitors(ctx: &Context, namespace: Option<&str>) -> Api<DynamicObject> {
    let resource = service_monitor_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(ctx.client.clone(), ns, &resource),
        None => Api::all_with(ctx.client.clone(), &resource),
    }
}

/// ServiceMonitors for this database outside `keep_namespace`
async fn delete_service_monitors(
    ctx: &Context,
    es: &Elasticsearch,
    keep_namespace: Option<&str>,
) -> Result<usize> {
    let wanted = crate::resources::monitor::service_monitor_name(es);
    let params = ListParams::default().labels(&selector_string(&database_selector(&es.name_any())));
    let list = service_monitors(ctx, None).list(&params).await?;

    let mut deleted = 0;
    for sm in list.items {
        let Some(ns) = sm.namespace() else { continue };
        if sm.name_any() != wanted || Some(ns.as_str()) == keep_namespace {
            continue;
        }
        match service_monitors(ctx, Some(&ns))
            .delete(&wanted, &DeleteParams::default())
            .await
        {
            Ok(_) => deleted += 1,
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(deleted)
}

async fn apply_monitor(ctx: &Context, es: &Elasticsearch) -> Result<Verb> {
    let Some((ns, desired)) = generate_service_monitor(es) else {
        delete_service_monitors(ctx, es, None).await?;
        return Ok(Verb::Unchanged);
    };
    let api = service_monitors(ctx, Some(&ns));
    let name = desired.name_any();
    let existing = api.get_opt(&name).await?;
    let verb = decide_verb(
        existing.as_ref().map(serde_json::to_value).transpose()?.as_ref(),
        &serde_json::to_value(&desired)?,
    );
    if verb != Verb::Unchanged {
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&desired),
        )
        .await?;
    }
    // the monitoring namespace may have moved
    delete_service_monitors(ctx, es, Some(&ns)).await?;
    Ok(verb)
}

/// Install or remove monitoring, reporting the outcome as events
///
/// Monitoring problems never fail the reconcile.
pub async fn ensure_monitor(ctx: &Context, es: &Elasticsearch) {
    if es.spec.monitor.is_none() {
        match remove_monitor(ctx, es).await {
            Ok(true) => {
                ctx.normal(
                    es,
                    reasons::SUCCESSFUL_MONITOR_DELETE,
                    actions::MONITOR,
                    "Successfully deleted monitoring system.",
                )
                .await
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "failed to remove monitor");
                ctx.warning(
                    es,
                    reasons::FAILED_TO_DELETE_MONITOR,
                    actions::MONITOR,
                    format!("Failed to delete monitoring system. Reason: {e}"),
                )
                .await;
            }
        }
        return;
    }

    match apply_monitor(ctx, es).await {
        Ok(Verb::Unchanged) => {}
        Ok(_) => {
            ctx.normal(
                es,
                reasons::SUCCESSFUL_MONITOR_ADD,
                actions::MONITOR,
                "Successfully added monitoring system.",
            )
            .await
        }
        Err(e) => {
            warn!(error = %e, "failed to add monitor");
            ctx.warning(
                es,
                reasons::FAILED_TO_ADD_MONITOR,
                actions::MONITOR,
                format!("Failed to add monitoring system. Reason: {e}"),
            )
            .await;
        }
    }
}

/// Delete the stats service and any ServiceMonitor; true if anything went
pub async fn remove_monitor(ctx: &Context, es: &Elasticsearch) -> Result<bool> {
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace(es)?);
    let stats = delete_if_exists(&services, &stats_service_name(es)).await?;
    let monitors = delete_service_monitors(ctx, es, None).await?;
    Ok(stats || monitors > 0)
}

/// Remove node StatefulSets and services; volumes and secrets stay
pub async fn delete_workloads(ctx: &Context, es: &Elasticsearch) -> Result<()> {
    let ns = namespace(es)?;
    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
    for group in node_groups(es) {
        delete_if_exists(&statefulsets, &group.name).await?;
    }
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);
    for name in [es.name_any(), master_service_name(es), stats_service_name(es)] {
        delete_if_exists(&services, &name).await?;
    }
    info!(namespace = %ns, name = %es.name_any(), "deleted workloads and services");
    Ok(())
}

/// Delete every volume claim labelled for database `name`
pub async fn delete_volumes(ctx: &Context, namespace: &str, name: &str) -> Result<usize> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
    let params = ListParams::default().labels(&selector_string(&database_selector(name)));
    let claims = api.list(&params).await?;
    let mut deleted = 0;
    for claim in claims.items {
        if delete_if_exists(&api, &claim.name_any()).await? {
            deleted += 1;
        }
    }
    debug!(namespace, name, deleted, "deleted volume claims");
    Ok(deleted)
}
