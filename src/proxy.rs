//! Overlay proxy controller.
//!
//! Owns the path-based reverse proxy configuration of the overlay agent:
//! three static routes (API, auth, frontend) plus one `/{service-id}`
//! route per running user-facing deployment. Commands issued to the
//! agent (`tailscale serve`) are idempotent add-or-replace / and
//! remove-if-exists, so reconciliation can always replay the full set.

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyRoute {
    pub path: String,
    pub upstream: String,
}

/// Route path for a service id: the composite `file:service` id becomes
/// one stable path segment.
pub fn route_path(service_id: &str) -> String {
    format!("/{}", service_id.replace([':', '/'], "-"))
}

pub struct ProxyController {
    enabled: bool,
    backend_port: u16,
    frontend_port: u16,
    routes: Mutex<BTreeMap<String, String>>,
}

impl ProxyController {
    pub fn new(enabled: bool, backend_port: u16, frontend_port: u16) -> Self {
        Self {
            enabled,
            backend_port,
            frontend_port,
            routes: Mutex::new(BTreeMap::new()),
        }
    }

    /// The three routes the controller always owns.
    fn static_routes(&self) -> Vec<(String, String)> {
        vec![
            ("/api".to_string(), format!("localhost:{}", self.backend_port)),
            ("/auth".to_string(), format!("localhost:{}", self.backend_port)),
            ("/".to_string(), format!("localhost:{}", self.frontend_port)),
        ]
    }

    /// Apply one add-or-replace command to the overlay agent.
    async fn apply_add(&self, path: &str, upstream: &str) {
        if !self.enabled {
            debug!("proxy disabled; skipping add {} -> {}", path, upstream);
            return;
        }
        let target = format!("http://{}", upstream);
        let result = Command::new("tailscale")
            .args(["serve", "--bg", "--set-path", path, &target])
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                info!("proxy route {} -> {}", path, upstream);
            }
            Ok(output) => {
                warn!(
                    "tailscale serve failed for {}: {}",
                    path,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => {
                warn!("could not run tailscale serve: {}", e);
            }
        }
    }

    /// Apply one remove-if-exists command to the overlay agent.
    async fn apply_remove(&self, path: &str) {
        if !self.enabled {
            return;
        }
        let result = Command::new("tailscale")
            .args(["serve", "--bg", "--set-path", path, "off"])
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                info!("proxy route {} removed", path);
            }
            Ok(output) => {
                debug!(
                    "tailscale serve remove for {}: {}",
                    path,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => {
                warn!("could not run tailscale serve: {}", e);
            }
        }
    }

    pub async fn ensure_static_routes(&self) {
        for (path, upstream) in self.static_routes() {
            let mut routes = self.routes.lock().await;
            routes.insert(path.clone(), upstream.clone());
            drop(routes);
            self.apply_add(&path, &upstream).await;
        }
    }

    /// Add-or-replace the route for a running deployment.
    pub async fn add_service_route(&self, service_id: &str, upstream: &str) {
        let path = route_path(service_id);
        {
            let mut routes = self.routes.lock().await;
            if routes.get(&path).map(String::as_str) == Some(upstream) {
                return;
            }
            routes.insert(path.clone(), upstream.to_string());
        }
        self.apply_add(&path, upstream).await;
    }

    /// Remove the route for a stopped or removed deployment.
    pub async fn remove_service_route(&self, service_id: &str) {
        let path = route_path(service_id);
        let removed = {
            let mut routes = self.routes.lock().await;
            routes.remove(&path).is_some()
        };
        if removed {
            self.apply_remove(&path).await;
        }
    }

    /// Startup reconciliation: issue the full desired set, then drop any
    /// dynamic route the controller held that the engine no longer
    /// recognises.
    pub async fn reconcile(&self, desired: Vec<(String, String)>) {
        self.ensure_static_routes().await;

        let desired_paths: BTreeMap<String, String> = desired
            .into_iter()
            .map(|(service_id, upstream)| (route_path(&service_id), upstream))
            .collect();

        let stale: Vec<String> = {
            let routes = self.routes.lock().await;
            let static_paths: Vec<String> = self
                .static_routes()
                .into_iter()
                .map(|(path, _)| path)
                .collect();
            routes
                .keys()
                .filter(|path| {
                    !static_paths.contains(path) && !desired_paths.contains_key(*path)
                })
                .cloned()
                .collect()
        };

        for path in stale {
            let mut routes = self.routes.lock().await;
            routes.remove(&path);
            drop(routes);
            self.apply_remove(&path).await;
        }

        for (path, upstream) in desired_paths {
            let mut routes = self.routes.lock().await;
            routes.insert(path.clone(), upstream.clone());
            drop(routes);
            self.apply_add(&path, &upstream).await;
        }
    }

    /// Current route table snapshot for diagnostics.
    pub async fn routes(&self) -> Vec<ProxyRoute> {
        let routes = self.routes.lock().await;
        routes
            .iter()
            .map(|(path, upstream)| ProxyRoute {
                path: path.clone(),
                upstream: upstream.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ProxyController {
        // Disabled: route bookkeeping is exercised without shelling out.
        ProxyController::new(false, 8010, 3010)
    }

    #[test]
    fn test_route_path_sanitises_ids() {
        assert_eq!(route_path("nginx:nginx"), "/nginx-nginx");
        assert_eq!(
            route_path("chronicle:chronicle-backend"),
            "/chronicle-chronicle-backend"
        );
    }

    #[tokio::test]
    async fn test_running_deployment_has_route_stopped_does_not() {
        let proxy = controller();
        proxy.add_service_route("nginx:nginx", "worker-1:8080").await;
        let routes = proxy.routes().await;
        assert!(routes
            .iter()
            .any(|r| r.path == "/nginx-nginx" && r.upstream == "worker-1:8080"));

        proxy.remove_service_route("nginx:nginx").await;
        let routes = proxy.routes().await;
        assert!(!routes.iter().any(|r| r.path == "/nginx-nginx"));
    }

    #[tokio::test]
    async fn test_reconcile_replaces_unknown_routes() {
        let proxy = controller();
        proxy.add_service_route("ghost:ghost", "gone:1111").await;
        proxy
            .reconcile(vec![("nginx:nginx".to_string(), "worker-1:8080".to_string())])
            .await;

        let routes = proxy.routes().await;
        assert!(!routes.iter().any(|r| r.path == "/ghost-ghost"));
        assert!(routes.iter().any(|r| r.path == "/nginx-nginx"));
        // Static routes are always present.
        assert!(routes.iter().any(|r| r.path == "/api"));
        assert!(routes.iter().any(|r| r.path == "/auth"));
        assert!(routes.iter().any(|r| r.path == "/"));
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let proxy = controller();
        proxy.add_service_route("nginx:nginx", "worker-1:8080").await;
        proxy.add_service_route("nginx:nginx", "worker-1:8080").await;
        let routes = proxy.routes().await;
        assert_eq!(
            routes.iter().filter(|r| r.path == "/nginx-nginx").count(),
            1
        );
    }
}
