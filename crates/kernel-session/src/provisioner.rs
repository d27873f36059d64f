//! Connection provisioner: decides where a kernel comes from.
//!
//! A kernel service is obtained from, in order of preference:
//! - an injected `ServiceManager` (local backend, mock, custom transport)
//! - a lite loader (in-process kernels)
//! - a remote Jupyter server, after an authentication probe
//!
//! On top of that service, the provisioner either attaches to a running
//! kernel (by id or by index), starts the default kernel, or starts nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::DEFAULT_KERNEL_NAME;
use crate::error::{KernelSessionError, Result};
use crate::executor::DEFAULT_EXECUTION_TIMEOUT;
use crate::kernel::{Kernel, KernelOptions};
use crate::reconnect::{MemoryReconnectionStore, ReconnectionStore};
use crate::service::{KernelModel, KernelType, ServiceManager};
use crate::store::StateStore;

/// Boots an in-process kernel service.
#[async_trait]
pub trait LiteKernelLoader: Send + Sync {
    async fn load(&self) -> Result<ServiceManager>;
}

/// Builds a service manager talking to a remote Jupyter server.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, server_url: &str, token: Option<&str>) -> Result<ServiceManager>;
}

/// Called with the server's login URL when the auth probe is rejected.
pub type LoginRedirect = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ProvisionConfig {
    pub services: Option<ServiceManager>,
    pub lite: Option<Arc<dyn LiteKernelLoader>>,
    pub remote: Option<Arc<dyn RemoteConnector>>,
    pub server_url: Option<String>,
    pub server_token: Option<String>,
    pub start_default_kernel: bool,
    pub default_kernel_name: String,
    pub use_running_kernel_id: Option<String>,
    pub use_running_kernel_index: Option<usize>,
    pub init_code: Option<String>,
    pub kernel_type: KernelType,
    pub execution_timeout: Option<Duration>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            services: None,
            lite: None,
            remote: None,
            server_url: None,
            server_token: None,
            start_default_kernel: false,
            default_kernel_name: DEFAULT_KERNEL_NAME.to_string(),
            use_running_kernel_id: None,
            use_running_kernel_index: None,
            init_code: None,
            kernel_type: KernelType::Notebook,
            execution_timeout: Some(DEFAULT_EXECUTION_TIMEOUT),
        }
    }
}

impl std::fmt::Debug for ProvisionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionConfig")
            .field("services", &self.services.is_some())
            .field("lite", &self.lite.is_some())
            .field("remote", &self.remote.is_some())
            .field("server_url", &self.server_url)
            .field("start_default_kernel", &self.start_default_kernel)
            .field("default_kernel_name", &self.default_kernel_name)
            .field("use_running_kernel_id", &self.use_running_kernel_id)
            .field("use_running_kernel_index", &self.use_running_kernel_index)
            .field("kernel_type", &self.kernel_type)
            .finish_non_exhaustive()
    }
}

impl ProvisionConfig {
    /// Reject contradictory kernel selections. Performs no I/O.
    pub fn validate(&self) -> Result<()> {
        let by_id = self.use_running_kernel_id.is_some();
        let by_index = self.use_running_kernel_index.is_some();
        if by_id && by_index {
            return Err(KernelSessionError::Configuration(
                "use_running_kernel_id and use_running_kernel_index cannot both be set".to_string(),
            ));
        }
        if self.start_default_kernel && (by_id || by_index) {
            return Err(KernelSessionError::Configuration(
                "start_default_kernel cannot be combined with a running kernel selection"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// A kernel service and, when one was requested, a kernel on it.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub services: ServiceManager,
    pub kernel: Option<Arc<Kernel>>,
}

pub struct Provisioner {
    config: ProvisionConfig,
    store: Arc<StateStore>,
    reconnection: Arc<dyn ReconnectionStore>,
    login_redirect: Option<LoginRedirect>,
    http: reqwest::Client,
}

impl Provisioner {
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            config,
            store: Arc::new(StateStore::new()),
            reconnection: Arc::new(MemoryReconnectionStore::new()),
            login_redirect: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_reconnection_store(mut self, reconnection: Arc<dyn ReconnectionStore>) -> Self {
        self.reconnection = reconnection;
        self
    }

    pub fn on_login_redirect(mut self, redirect: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.login_redirect = Some(Arc::new(redirect));
        self
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub async fn provision(&self) -> Result<Provisioned> {
        self.config.validate()?;

        let services = self.service_manager().await?;
        services.ready().await?;

        let kernel = if let Some(index) = self.config.use_running_kernel_index {
            let model = self.running_by_index(&services, index).await?;
            Some(self.attach(&services, model))
        } else if let Some(id) = &self.config.use_running_kernel_id {
            let model = self.running_by_id(&services, id).await?;
            Some(self.attach(&services, model))
        } else if self.config.start_default_kernel {
            log::info!(
                "[provisioner] Starting kernel {}",
                self.config.default_kernel_name
            );
            let options = self.kernel_options(&services, &self.config.default_kernel_name);
            Some(Kernel::new(options))
        } else {
            None
        };

        Ok(Provisioned { services, kernel })
    }

    async fn service_manager(&self) -> Result<ServiceManager> {
        if let Some(services) = &self.config.services {
            return Ok(services.clone());
        }
        if let Some(lite) = &self.config.lite {
            log::info!("[provisioner] Loading lite kernel service");
            return lite.load().await;
        }
        let Some(server_url) = &self.config.server_url else {
            return Err(KernelSessionError::Configuration(
                "no kernel service: set services, lite or server_url".to_string(),
            ));
        };
        self.probe_auth(server_url).await?;
        let remote = self.config.remote.as_ref().ok_or_else(|| {
            KernelSessionError::Configuration(format!("no remote connector for {}", server_url))
        })?;
        remote
            .connect(server_url, self.config.server_token.as_deref())
            .await
    }

    /// Check that the server accepts our token.
    ///
    /// A 401/403 triggers the login redirect hook and yields `Ok(false)`;
    /// provisioning continues regardless. Network failures are errors.
    pub async fn probe_auth(&self, server_url: &str) -> Result<bool> {
        let base = server_url.trim_end_matches('/');
        let url = Url::parse(&format!("{}/api/kernels", base)).map_err(|e| {
            KernelSessionError::Configuration(format!("invalid server url {}: {}", server_url, e))
        })?;

        let mut request = self.http.get(url);
        if let Some(token) = self.config.server_token.as_deref().filter(|t| !t.is_empty()) {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {}", token));
        }
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(true);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let login_url = format!("{}/login", base);
            log::warn!(
                "[provisioner] You need to authenticate on the Jupyter server: {}",
                login_url
            );
            if let Some(redirect) = &self.login_redirect {
                redirect(&login_url);
            }
        } else {
            log::warn!("[provisioner] Unexpected status {} from {}", status, base);
        }
        Ok(false)
    }

    async fn running_by_index(&self, services: &ServiceManager, index: usize) -> Result<KernelModel> {
        services.kernels.refresh_running().await?;
        let running = services.kernels.running();
        let count = running.len();
        running.into_iter().nth(index).ok_or_else(|| {
            KernelSessionError::NotFound(format!(
                "running kernel index {} ({} running)",
                index, count
            ))
        })
    }

    async fn running_by_id(&self, services: &ServiceManager, id: &str) -> Result<KernelModel> {
        services.kernels.refresh_running().await?;
        services
            .kernels
            .running()
            .into_iter()
            .find(|model| model.id == id)
            .ok_or_else(|| KernelSessionError::NotFound(format!("running kernel {}", id)))
    }

    fn attach(&self, services: &ServiceManager, model: KernelModel) -> Arc<Kernel> {
        log::info!(
            "[provisioner] Using running kernel {} ({})",
            model.id,
            model.name
        );
        let mut options = self.kernel_options(services, &model.name);
        options.kernel_model = Some(model);
        Kernel::new(options)
    }

    fn kernel_options(&self, services: &ServiceManager, spec_name: &str) -> KernelOptions {
        let mut options = KernelOptions::new(services.clone(), spec_name);
        options.kernel_type = self.config.kernel_type;
        options.reconnection = self.reconnection.clone();
        options.store = self.store.clone();
        options.init_code = self.config.init_code.clone();
        options.execution_timeout = self.config.execution_timeout;
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockServices;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn with_services(services: &MockServices) -> ProvisionConfig {
        ProvisionConfig {
            services: Some(services.service_manager()),
            ..ProvisionConfig::default()
        }
    }

    /// Serve one canned HTTP response and hand back the raw request.
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n[]",
                status_line
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, handle)
    }

    #[test]
    fn test_validate_rejects_both_selectors() {
        let config = ProvisionConfig {
            use_running_kernel_id: Some("k".to_string()),
            use_running_kernel_index: Some(0),
            ..ProvisionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KernelSessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_default_with_selector() {
        for config in [
            ProvisionConfig {
                start_default_kernel: true,
                use_running_kernel_id: Some("k".to_string()),
                ..ProvisionConfig::default()
            },
            ProvisionConfig {
                start_default_kernel: true,
                use_running_kernel_index: Some(1),
                ..ProvisionConfig::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(KernelSessionError::Configuration(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_no_kernel_requested() {
        let services = MockServices::new();
        let provisioned = Provisioner::new(with_services(&services))
            .provision()
            .await
            .unwrap();
        assert!(provisioned.kernel.is_none());
        assert!(services.sessions.started().is_empty());
    }

    #[tokio::test]
    async fn test_start_default_kernel() {
        let services = MockServices::new();
        let config = ProvisionConfig {
            start_default_kernel: true,
            ..with_services(&services)
        };
        let kernel = Provisioner::new(config)
            .provision()
            .await
            .unwrap()
            .kernel
            .unwrap();
        kernel.ready().await.unwrap();
        assert_eq!(kernel.kernel_spec_name(), "python3");
    }

    #[tokio::test]
    async fn test_running_kernel_by_index() {
        let services = MockServices::new();
        for id in ["a", "b"] {
            services.kernels.add_running(KernelModel {
                id: id.to_string(),
                name: "python3".to_string(),
            });
        }
        let config = ProvisionConfig {
            use_running_kernel_index: Some(1),
            ..with_services(&services)
        };
        let kernel = Provisioner::new(config)
            .provision()
            .await
            .unwrap()
            .kernel
            .unwrap();
        kernel.ready().await.unwrap();
        assert_eq!(kernel.id().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_running_kernel_index_out_of_bounds() {
        let services = MockServices::new();
        let config = ProvisionConfig {
            use_running_kernel_index: Some(0),
            ..with_services(&services)
        };
        let result = Provisioner::new(config).provision().await;
        assert!(matches!(result, Err(KernelSessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_running_kernel_id_missing() {
        let services = MockServices::new();
        let config = ProvisionConfig {
            use_running_kernel_id: Some("nope".to_string()),
            ..with_services(&services)
        };
        let result = Provisioner::new(config).provision().await;
        assert!(matches!(result, Err(KernelSessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_lite_loader_is_used() {
        struct Loader(MockServices);

        #[async_trait]
        impl LiteKernelLoader for Loader {
            async fn load(&self) -> Result<ServiceManager> {
                Ok(self.0.service_manager())
            }
        }

        let services = MockServices::new();
        let config = ProvisionConfig {
            lite: Some(Arc::new(Loader(services.clone()))),
            start_default_kernel: true,
            ..ProvisionConfig::default()
        };
        let kernel = Provisioner::new(config)
            .provision()
            .await
            .unwrap()
            .kernel
            .unwrap();
        kernel.ready().await.unwrap();
        assert_eq!(services.sessions.started().len(), 1);
    }

    #[tokio::test]
    async fn test_no_source_is_configuration_error() {
        let result = Provisioner::new(ProvisionConfig::default()).provision().await;
        assert!(matches!(result, Err(KernelSessionError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_auth_probe_sends_token() {
        let (url, server) = one_shot_server("200 OK").await;
        let provisioner = Provisioner::new(ProvisionConfig {
            server_token: Some("secret".to_string()),
            ..ProvisionConfig::default()
        });

        assert!(provisioner.probe_auth(&format!("{}/", url)).await.unwrap());
        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("get /api/kernels "));
        assert!(request.contains("authorization: token secret"));
    }

    #[tokio::test]
    async fn test_auth_probe_forbidden_triggers_login_redirect() {
        let (url, _server) = one_shot_server("403 Forbidden").await;
        let redirected = Arc::new(Mutex::new(None));
        let provisioner = {
            let redirected = redirected.clone();
            Provisioner::new(ProvisionConfig::default()).on_login_redirect(move |login| {
                *redirected.lock().unwrap() = Some(login.to_string());
            })
        };

        assert!(!provisioner.probe_auth(&url).await.unwrap());
        assert_eq!(
            redirected.lock().unwrap().clone(),
            Some(format!("{}/login", url))
        );
    }

    #[tokio::test]
    async fn test_auth_probe_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let provisioner = Provisioner::new(ProvisionConfig::default());
        assert!(matches!(
            provisioner.probe_auth(&url).await,
            Err(KernelSessionError::Transport(_))
        ));
    }
}
