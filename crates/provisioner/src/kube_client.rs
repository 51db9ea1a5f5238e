//! Kubernetes client construction for [`KubeGateway`](crate::gateway::KubeGateway).

use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::gateway::GatewayError;

/// Where and how to reach the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterConnection {
    /// Explicit kubeconfig file. Without one the default chain is used
    /// (`KUBECONFIG`, `~/.kube/config`, in-cluster service account).
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use instead of `current-context`.
    pub context: Option<String>,
    /// Upper bound for reading one API response.
    pub request_timeout: Option<Duration>,
}

fn connection_failed(message: impl Into<String>) -> GatewayError {
    GatewayError::ConnectionFailed {
        message: message.into(),
    }
}

/// Resolve the client configuration for `connection` without connecting.
pub async fn client_config(
    connection: &ClusterConnection,
) -> Result<Config, Report<GatewayError>> {
    let options = KubeConfigOptions {
        context: connection.context.clone(),
        ..Default::default()
    };

    let mut config = match (&connection.kubeconfig, &connection.context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(|| {
                connection_failed(format!("Failed to read kubeconfig file: {}", path.display()))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .change_context_lazy(|| {
                    connection_failed(format!(
                        "Failed to create config from kubeconfig: {}",
                        path.display()
                    ))
                })?
        }
        (None, Some(context)) => Config::from_kubeconfig(&options)
            .await
            .change_context_lazy(|| {
                connection_failed(format!("Failed to load kubeconfig context {context:?}"))
            })?,
        (None, None) => Config::infer()
            .await
            .change_context(connection_failed("Failed to infer Kubernetes config"))?,
    };

    if let Some(timeout) = connection.request_timeout {
        config.read_timeout = Some(timeout);
    }
    Ok(config)
}

pub async fn init_kube_client(
    connection: &ClusterConnection,
) -> Result<Client, Report<GatewayError>> {
    let config = client_config(connection).await?;
    tracing::info!(
        cluster = %config.cluster_url,
        namespace = %config.default_namespace,
        "Connecting to Kubernetes"
    );
    Client::try_from(config)
        .change_context(connection_failed("Failed to create Kubernetes client"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
  - name: dev
    cluster:
      server: https://dev.example.com:6443
  - name: prod
    cluster:
      server: https://prod.example.com:6443
users:
  - name: ci
    user:
      token: not-a-real-token
contexts:
  - name: dev
    context:
      cluster: dev
      user: ci
  - name: prod
    context:
      cluster: prod
      user: ci
      namespace: ml
"#;

    fn kubeconfig_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KUBECONFIG.as_bytes()).unwrap();
        file
    }

    #[test(tokio::test)]
    async fn explicit_kubeconfig_uses_current_context() {
        let file = kubeconfig_file();
        let config = client_config(&ClusterConnection {
            kubeconfig: Some(file.path().to_path_buf()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(config.cluster_url.host(), Some("dev.example.com"));
        assert_eq!(config.default_namespace, "default");
    }

    #[test(tokio::test)]
    async fn context_and_timeout_are_applied() {
        let file = kubeconfig_file();
        let config = client_config(&ClusterConnection {
            kubeconfig: Some(file.path().to_path_buf()),
            context: Some("prod".to_string()),
            request_timeout: Some(Duration::from_secs(15)),
        })
        .await
        .unwrap();
        assert_eq!(config.cluster_url.host(), Some("prod.example.com"));
        assert_eq!(config.default_namespace, "ml");
        assert_eq!(config.read_timeout, Some(Duration::from_secs(15)));
    }

    #[test(tokio::test)]
    async fn unknown_context_is_a_connection_error() {
        let file = kubeconfig_file();
        let err = client_config(&ClusterConnection {
            kubeconfig: Some(file.path().to_path_buf()),
            context: Some("staging".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err.current_context(),
            GatewayError::ConnectionFailed { .. }
        ));
    }
}
