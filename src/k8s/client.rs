use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::config::Kubeconfig;
use kube::{Api, Client, Config};

fn infer_cluster_name() -> Option<String> {
    let kubeconfig = Kubeconfig::read().ok()?;
    let current = kubeconfig.current_context.as_ref()?;
    let named = kubeconfig.contexts.iter().find(|nc| nc.name == *current)?;
    let ctx = named.context.as_ref()?;
    Some(ctx.cluster.clone())
}

/// Thin wrapper over `kube::Client` exposing only the surface the quota
/// controller needs: the overrides ConfigMap (read + CAS write) and a
/// rollout-trigger annotation patch on the three workload kinds the platform
/// runs its components as.
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    cluster_name: Option<String>,
}

impl K8sClient {
    pub async fn new(config_file: Option<&str>) -> Result<Self> {
        if let Some(path) = config_file {
            std::env::set_var("KUBECONFIG", path);
        }
        let cluster_name = infer_cluster_name();
        let config = Config::infer().await?;
        let client = Client::try_from(config)?;
        Ok(Self { client, cluster_name })
    }

    pub fn kube(&self) -> &Client {
        &self.client
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Current artifact ConfigMap, or `None` if it doesn't exist yet. An
    /// unreadable artifact (not-found) is not an error: the publisher treats
    /// it as an empty starting document.
    pub async fn get_artifact(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        match self.config_maps(namespace).get_opt(name).await {
            Ok(cm) => Ok(cm),
            Err(e) => Err(e).context("fetching overrides artifact"),
        }
    }

    /// Compare-and-swap write: `expected_resource_version` must be `None` to
    /// create, or `Some(rv)` to replace only if the artifact hasn't moved
    /// since it was read. A version mismatch surfaces as a conflict error the
    /// caller retries with backoff.
    pub async fn put_artifact(
        &self,
        namespace: &str,
        mut cm: ConfigMap,
        expected_resource_version: Option<&str>,
    ) -> Result<ConfigMap> {
        let api = self.config_maps(namespace);
        let name = cm
            .metadata
            .name
            .clone()
            .context("artifact ConfigMap must have a name")?;

        match expected_resource_version {
            None => api
                .create(&Default::default(), &cm)
                .await
                .context("creating overrides artifact"),
            Some(rv) => {
                cm.metadata.resource_version = Some(rv.to_string());
                api.replace(&name, &Default::default(), &cm)
                    .await
                    .context("replacing overrides artifact")
            }
        }
    }

    /// Touch a rollout-trigger annotation on every named Deployment,
    /// StatefulSet or DaemonSet, as a strategic-merge patch. Best-effort per
    /// component: one missing workload doesn't fail the whole rollout.
    pub async fn annotate_rollout(
        &self,
        namespace: &str,
        component: &str,
        annotation_key: &str,
        value: &str,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { annotation_key: value }
                    }
                }
            }
        });
        let pp = PatchParams::default();

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        if deployments.get_opt(component).await?.is_some() {
            deployments
                .patch(component, &pp, &Patch::Strategic(&patch))
                .await
                .with_context(|| format!("patching deployment/{component} rollout annotation"))?;
            return Ok(());
        }

        let stateful_sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        if stateful_sets.get_opt(component).await?.is_some() {
            stateful_sets
                .patch(component, &pp, &Patch::Strategic(&patch))
                .await
                .with_context(|| format!("patching statefulset/{component} rollout annotation"))?;
            return Ok(());
        }

        let daemon_sets: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        if daemon_sets.get_opt(component).await?.is_some() {
            daemon_sets
                .patch(component, &pp, &Patch::Strategic(&patch))
                .await
                .with_context(|| format!("patching daemonset/{component} rollout annotation"))?;
            return Ok(());
        }

        anyhow::bail!("rollout component '{component}' not found as a deployment, statefulset or daemonset in namespace '{namespace}'");
    }
}
