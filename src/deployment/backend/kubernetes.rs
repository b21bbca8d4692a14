use anyhow::{anyhow, Context};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment as K8sDeployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar,
    HTTPGetAction, Namespace, Pod, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{BackendError, DeployOutcome, DeploymentBackend};
use crate::db::clusters;
use crate::db::models::{Deployment, DeploymentStatus};
use crate::deployment::models::ResolvedServiceDefinition;

const MANAGED_BY: &str = "ushadow";

/// Target options carried on the deployment's backend metadata.
#[derive(Debug, Clone, Deserialize)]
struct K8sTargetOptions {
    #[serde(default = "default_replicas")]
    replicas: i32,
    #[serde(default = "default_service_type")]
    service_type: String,
    #[serde(default)]
    ingress_host: Option<String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

fn default_replicas() -> i32 {
    1
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

impl Default for K8sTargetOptions {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            service_type: default_service_type(),
            ingress_host: None,
            annotations: BTreeMap::new(),
        }
    }
}

fn classify(err: kube::Error) -> BackendError {
    match &err {
        kube::Error::Api(response) if response.code < 500 => BackendError::failed(err),
        _ => BackendError::unavailable(err),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Backend that translates resolved definitions into Kubernetes objects
/// in a registered cluster. Clients are built from stored kubeconfigs and
/// cached per cluster id.
pub struct KubernetesBackend {
    db: PgPool,
    clients: moka::future::Cache<String, Client>,
}

impl KubernetesBackend {
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            clients: moka::future::Cache::builder()
                .max_capacity(32)
                .time_to_live(std::time::Duration::from_secs(3600))
                .build(),
        }
    }

    /// Build a client from a pasted kubeconfig. Also used at cluster
    /// registration time to validate the config before storing it.
    pub async fn client_from_kubeconfig(kubeconfig_yaml: &str) -> anyhow::Result<Client> {
        let kubeconfig =
            Kubeconfig::from_yaml(kubeconfig_yaml).context("invalid kubeconfig YAML")?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("failed to build client config from kubeconfig")?;
        Client::try_from(config).context("failed to build Kubernetes client")
    }

    async fn client_for(&self, cluster_id: &str) -> Result<Client, BackendError> {
        let db = self.db.clone();
        let id = cluster_id.to_string();
        self.clients
            .try_get_with(id.clone(), async move {
                let cluster = clusters::get(&db, &id)
                    .await?
                    .ok_or_else(|| anyhow!("cluster '{}' not registered", id))?;
                Self::client_from_kubeconfig(&cluster.kubeconfig).await
            })
            .await
            .map_err(|e: std::sync::Arc<anyhow::Error>| {
                BackendError::unavailable(anyhow!("{}", e))
            })
    }

    async fn target_of(
        &self,
        deployment: &Deployment,
    ) -> Result<(Client, String), BackendError> {
        let cluster_id = deployment
            .cluster_id
            .as_deref()
            .ok_or_else(|| BackendError::failed(anyhow!("deployment has no cluster id")))?;
        let client = self.client_for(cluster_id).await?;
        let namespace = match deployment.namespace.clone() {
            Some(ns) => ns,
            None => {
                let cluster = clusters::get(&self.db, cluster_id)
                    .await
                    .map_err(BackendError::unavailable)?
                    .ok_or_else(|| {
                        BackendError::failed(anyhow!("cluster '{}' not registered", cluster_id))
                    })?;
                cluster.default_namespace
            }
        };
        Ok((client, namespace))
    }

    fn labels(resolved_name: &str, container_name: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), resolved_name.to_string());
        labels.insert(
            "app.kubernetes.io/instance".to_string(),
            container_name.to_string(),
        );
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        );
        labels
    }

    async fn ensure_namespace(&self, client: &Client, namespace: &str) -> Result<(), BackendError> {
        let api: Api<Namespace> = Api::all(client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    fn container_name_of(deployment: &Deployment) -> Result<&str, BackendError> {
        deployment
            .container_name
            .as_deref()
            .ok_or_else(|| BackendError::failed(anyhow!("deployment has no container name")))
    }

    fn build_deployment(
        resolved: &ResolvedServiceDefinition,
        container_name: &str,
        options: &K8sTargetOptions,
        container_port: u16,
        has_env_configmap: bool,
    ) -> K8sDeployment {
        let labels = Self::labels(&resolved.compose_service_name, container_name);

        let env: Vec<EnvVar> = resolved
            .environment
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        let env_from = has_env_configmap.then(|| {
            vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: format!("{}-env", container_name),
                    optional: Some(false),
                }),
                ..Default::default()
            }]
        });

        let probe = resolved.health_check_path.as_ref().map(|path| Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.clone()),
                port: IntOrString::Int(container_port as i32),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(15),
            ..Default::default()
        });

        let container = Container {
            name: resolved.compose_service_name.clone(),
            image: Some(resolved.image.clone()),
            command: resolved
                .command
                .as_ref()
                .map(|c| c.split_whitespace().map(|s| s.to_string()).collect()),
            env: Some(env),
            env_from,
            ports: Some(vec![ContainerPort {
                container_port: container_port as i32,
                ..Default::default()
            }]),
            readiness_probe: probe.clone(),
            liveness_probe: probe,
            ..Default::default()
        };

        K8sDeployment {
            metadata: ObjectMeta {
                name: Some(container_name.to_string()),
                labels: Some(labels.clone()),
                annotations: (!options.annotations.is_empty())
                    .then(|| options.annotations.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(options.replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_service(
        resolved: &ResolvedServiceDefinition,
        container_name: &str,
        options: &K8sTargetOptions,
        container_port: u16,
    ) -> Service {
        let labels = Self::labels(&resolved.compose_service_name, container_name);
        Service {
            metadata: ObjectMeta {
                name: Some(container_name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(labels),
                type_: Some(options.service_type.clone()),
                ports: Some(vec![ServicePort {
                    port: container_port as i32,
                    target_port: Some(IntOrString::Int(container_port as i32)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_ingress(
        resolved: &ResolvedServiceDefinition,
        container_name: &str,
        host: &str,
        container_port: u16,
    ) -> Ingress {
        let labels = Self::labels(&resolved.compose_service_name, container_name);
        Ingress {
            metadata: ObjectMeta {
                name: Some(container_name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: container_name.to_string(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(container_port as i32),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DeploymentBackend for KubernetesBackend {
    async fn deploy(
        &self,
        deployment: &Deployment,
        resolved: &ResolvedServiceDefinition,
        container_name: &str,
    ) -> Result<DeployOutcome, BackendError> {
        let (client, namespace) = self.target_of(deployment).await?;
        let options: K8sTargetOptions =
            serde_json::from_value(deployment.backend_metadata.clone()).unwrap_or_default();

        let container_port = resolved
            .primary_port()
            .map(|(_, container)| container)
            .unwrap_or(80);

        self.ensure_namespace(&client, &namespace).await?;

        // Imported-service .env literals become a ConfigMap referenced
        // from the pod via envFrom.
        let has_env_configmap = !resolved.env_literals.is_empty();
        if has_env_configmap {
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(format!("{}-env", container_name)),
                    labels: Some(Self::labels(&resolved.compose_service_name, container_name)),
                    ..Default::default()
                },
                data: Some(resolved.env_literals.clone().into_iter().collect()),
                ..Default::default()
            };
            let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
            match cm_api.create(&PostParams::default(), &cm).await {
                Ok(_) => {}
                Err(kube::Error::Api(response)) if response.code == 409 => {
                    cm_api
                        .replace(&format!("{}-env", container_name), &PostParams::default(), &cm)
                        .await
                        .map_err(classify)?;
                }
                Err(e) => return Err(classify(e)),
            }
        }

        let k8s_deployment = Self::build_deployment(
            resolved,
            container_name,
            &options,
            container_port,
            has_env_configmap,
        );
        let deploy_api: Api<K8sDeployment> = Api::namespaced(client.clone(), &namespace);
        deploy_api
            .create(&PostParams::default(), &k8s_deployment)
            .await
            .map_err(classify)?;

        let service = Self::build_service(resolved, container_name, &options, container_port);
        let service_api: Api<Service> = Api::namespaced(client.clone(), &namespace);
        service_api
            .create(&PostParams::default(), &service)
            .await
            .map_err(classify)?;

        let access_url = if let Some(host) = &options.ingress_host {
            let ingress =
                Self::build_ingress(resolved, container_name, host, container_port);
            let ingress_api: Api<Ingress> = Api::namespaced(client.clone(), &namespace);
            ingress_api
                .create(&PostParams::default(), &ingress)
                .await
                .map_err(classify)?;
            Some(format!("http://{}", host))
        } else {
            Some(format!(
                "http://{}.{}.svc.cluster.local:{}",
                container_name, namespace, container_port
            ))
        };

        info!(
            "created Kubernetes objects for {} in {}/{}",
            resolved.service_id, namespace, container_name
        );

        Ok(DeployOutcome {
            container_id: None,
            exposed_port: Some(container_port),
            access_url,
            metadata: json!({
                "runtime": "kubernetes",
                "namespace": namespace,
                "deployment_name": container_name,
                "replicas": options.replicas,
                "service_type": options.service_type,
                "ingress_host": options.ingress_host,
            }),
        })
    }

    async fn status(&self, deployment: &Deployment) -> Result<DeploymentStatus, BackendError> {
        let (client, namespace) = self.target_of(deployment).await?;
        let name = Self::container_name_of(deployment)?;
        let api: Api<K8sDeployment> = Api::namespaced(client, &namespace);

        let k8s_deployment = match api.get(name).await {
            Ok(d) => d,
            Err(e) if is_not_found(&e) => return Ok(DeploymentStatus::Failed),
            Err(e) => return Err(classify(e)),
        };

        let desired = k8s_deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        let ready = k8s_deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);

        Ok(if desired == 0 {
            DeploymentStatus::Stopped
        } else if ready > 0 {
            DeploymentStatus::Running
        } else {
            DeploymentStatus::Deploying
        })
    }

    async fn stop(&self, deployment: &Deployment) -> Result<(), BackendError> {
        let (client, namespace) = self.target_of(deployment).await?;
        let name = Self::container_name_of(deployment)?;
        let api: Api<K8sDeployment> = Api::namespaced(client, &namespace);

        let patch = json!({ "spec": { "replicas": 0 } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn remove(&self, deployment: &Deployment) -> Result<(), BackendError> {
        let (client, namespace) = self.target_of(deployment).await?;
        let name = Self::container_name_of(deployment)?;

        let deploy_api: Api<K8sDeployment> = Api::namespaced(client.clone(), &namespace);
        if let Err(e) = deploy_api.delete(name, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                return Err(classify(e));
            }
        }

        let service_api: Api<Service> = Api::namespaced(client.clone(), &namespace);
        if let Err(e) = service_api.delete(name, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                warn!("failed to delete service {}: {}", name, e);
            }
        }

        let cm_api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
        if let Err(e) = cm_api
            .delete(&format!("{}-env", name), &DeleteParams::default())
            .await
        {
            if !is_not_found(&e) {
                warn!("failed to delete configmap {}-env: {}", name, e);
            }
        }

        let ingress_api: Api<Ingress> = Api::namespaced(client, &namespace);
        if let Err(e) = ingress_api.delete(name, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                warn!("failed to delete ingress {}: {}", name, e);
            }
        }

        Ok(())
    }

    async fn logs(&self, deployment: &Deployment, tail: i64) -> Result<Vec<String>, BackendError> {
        let (client, namespace) = self.target_of(deployment).await?;
        let name = Self::container_name_of(deployment)?;

        let pod_api: Api<Pod> = Api::namespaced(client, &namespace);
        let pods = pod_api
            .list(&ListParams::default().labels(&format!(
                "app.kubernetes.io/instance={}",
                name
            )))
            .await
            .map_err(classify)?;

        let Some(pod_name) = pods
            .items
            .first()
            .and_then(|pod| pod.metadata.name.clone())
        else {
            return Ok(vec![format!("no pods found for {}", name)]);
        };

        let raw = pod_api
            .logs(
                &pod_name,
                &LogParams {
                    tail_lines: Some(tail),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        Ok(raw.lines().map(|l| l.to_string()).collect())
    }
}
