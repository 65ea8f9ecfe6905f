use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ports::PortProtocol;
use crate::config::settings::PortRange;
use crate::config::{DevContainerConfig, ForwardPort, OnAutoForward};
use crate::core::{ForgeError, ForgeResult};

#[derive(Debug, Clone, PartialEq)]
pub struct PortForward {
    pub port: ForwardPort,
    pub host_port: u16,
    pub label: Option<String>,
    pub on_auto_forward: OnAutoForward,
    pub protocol: PortProtocol,
}

impl PortForward {
    pub fn container_port(&self) -> u16 {
        self.port.port()
    }

    /// Only bare container ports are published by the container runtime.
    pub fn is_local(&self) -> bool {
        matches!(self.port, ForwardPort::Local(_))
    }

    pub fn url(&self) -> String {
        let scheme = match self.protocol {
            PortProtocol::Http => "http",
            PortProtocol::Https => "https",
        };
        format!("{}://localhost:{}", scheme, self.host_port)
    }

    pub fn display_label(&self) -> String {
        match &self.label {
            Some(label) => format!("{} ({})", label, self.port),
            None => format!("port {}", self.port),
        }
    }
}

/// What to do once a forwarded port starts answering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoForwardAction {
    Notify(String),
    OpenBrowser(String),
    OpenPreview(String),
    None,
}

#[derive(Clone)]
pub struct PortForwardManager {
    range: PortRange,
    forwards: Arc<RwLock<HashMap<String, Vec<PortForward>>>>,
}

impl PortForwardManager {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            forwards: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Decide the host port for every forwarded port of `config`.
    ///
    /// A port keeps its container number on the host when that is free. Otherwise the
    /// first free port in the configured range is used, unless `requireLocalPort` is set.
    /// `previous` pins ports already published for this environment.
    pub async fn plan_forwards(
        &self,
        env_name: &str,
        config: &DevContainerConfig,
        previous: &BTreeMap<String, u16>,
    ) -> ForgeResult<Vec<PortForward>> {
        let mut claimed: HashSet<u16> = self
            .forwards
            .read()
            .await
            .iter()
            .filter(|(name, _)| name.as_str() != env_name)
            .flat_map(|(_, list)| list.iter().map(|f| f.host_port))
            .collect();

        let mut planned = Vec::new();
        for port in &config.forward_ports {
            let attrs = config.attributes_for(port).cloned().unwrap_or_default();
            let on_auto_forward = attrs.on_auto_forward.unwrap_or_default();
            if on_auto_forward == OnAutoForward::Ignore {
                debug!(port = %port, "Port marked ignore, not forwarding");
                continue;
            }

            let host_port = match previous.get(&port.to_string()) {
                Some(bound) => *bound,
                None => {
                    let wanted = port.port();
                    if !claimed.contains(&wanted) && Self::is_port_free(wanted).await {
                        wanted
                    } else if attrs.require_local_port == Some(true) {
                        return Err(ForgeError::PortForward(format!(
                            "port {} is busy on the host and requireLocalPort is set",
                            wanted
                        )));
                    } else {
                        let fallback = self.find_available_port(&claimed).await?;
                        info!(port = %port, host_port = fallback, "Container port busy on host, remapped");
                        fallback
                    }
                }
            };
            claimed.insert(host_port);

            planned.push(PortForward {
                port: port.clone(),
                host_port,
                label: attrs.label.clone(),
                on_auto_forward,
                protocol: attrs.protocol.unwrap_or(PortProtocol::Http),
            });
        }

        self.forwards
            .write()
            .await
            .insert(env_name.to_string(), planned.clone());
        Ok(planned)
    }

    pub async fn list_forwards(&self, env_name: &str) -> Vec<PortForward> {
        self.forwards
            .read()
            .await
            .get(env_name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn remove_forwards(&self, env_name: &str) {
        self.forwards.write().await.remove(env_name);
    }

    async fn find_available_port(&self, claimed: &HashSet<u16>) -> ForgeResult<u16> {
        for port in self.range.start..=self.range.end {
            if !claimed.contains(&port) && Self::is_port_free(port).await {
                return Ok(port);
            }
        }
        Err(ForgeError::PortForward(format!(
            "no free host port in {}..={}",
            self.range.start, self.range.end
        )))
    }

    async fn is_port_free(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).await.is_ok()
    }

    /// Poll until something accepts connections on the forward's host port.
    pub async fn await_activation(forward: &PortForward, timeout: Duration, interval: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if TcpStream::connect(("127.0.0.1", forward.host_port)).await.is_ok() {
                debug!(port = forward.host_port, "Forwarded port is active");
                return true;
            }
            if tokio::time::Instant::now() + interval > deadline {
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub fn auto_forward_action(forward: &PortForward, opened: &BTreeSet<u16>) -> AutoForwardAction {
        let url = forward.url();
        match forward.on_auto_forward {
            OnAutoForward::Notify => AutoForwardAction::Notify(url),
            OnAutoForward::OpenBrowser => AutoForwardAction::OpenBrowser(url),
            OnAutoForward::OpenBrowserOnce if !opened.contains(&forward.container_port()) => {
                AutoForwardAction::OpenBrowser(url)
            }
            OnAutoForward::OpenPreview => AutoForwardAction::OpenPreview(url),
            OnAutoForward::OpenBrowserOnce | OnAutoForward::Silent | OnAutoForward::Ignore => {
                AutoForwardAction::None
            }
        }
    }
}

/// Hand `url` to the desktop's opener. Returns whether one was found.
pub fn open_in_browser(url: &str) -> ForgeResult<bool> {
    let opener = ["xdg-open", "open", "wslview"]
        .iter()
        .find_map(|name| which::which(name).ok());

    match opener {
        Some(path) => {
            std::process::Command::new(&path).arg(url).spawn()?;
            info!(url, opener = %path.display(), "Opened browser");
            Ok(true)
        }
        None => {
            warn!(url, "No browser opener found");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParserOptions;
    use pretty_assertions::assert_eq;

    fn config(content: &str) -> DevContainerConfig {
        DevContainerConfig::from_str_with(content, ConfigParserOptions::default()).unwrap()
    }

    /// A port the OS considers free right now.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_flask_port_is_tagged_for_browser() {
        let port = free_port().await;
        let config = config(&format!(
            r#"{{"image": "python:3.11", "forwardPorts": [{port}],
                "portsAttributes": {{"{port}": {{"label": "Flask App", "onAutoForward": "openBrowser"}}}}}}"#,
            port = port
        ));
        let manager = PortForwardManager::new(PortRange::default());

        let forwards = manager.plan_forwards("mockhouse", &config, &BTreeMap::new()).await.unwrap();
        assert_eq!(forwards.len(), 1);
        let forward = &forwards[0];
        assert_eq!(forward.container_port(), port);
        assert_eq!(forward.host_port, port);
        assert_eq!(forward.label.as_deref(), Some("Flask App"));
        assert_eq!(
            PortForwardManager::auto_forward_action(forward, &BTreeSet::new()),
            AutoForwardAction::OpenBrowser(format!("http://localhost:{}", port))
        );
        assert_eq!(manager.list_forwards("mockhouse").await, forwards);

        manager.remove_forwards("mockhouse").await;
        assert!(manager.list_forwards("mockhouse").await.is_empty());
    }

    #[tokio::test]
    async fn test_busy_port_is_remapped() {
        let busy = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let fallback_start = free_port().await;

        let manager = PortForwardManager::new(PortRange {
            start: fallback_start,
            end: fallback_start.saturating_add(50),
        });
        let forwards = manager
            .plan_forwards("env", &config(&format!(r#"{{"image": "a", "forwardPorts": [{}]}}"#, busy_port)), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(forwards[0].container_port(), busy_port);
        assert_ne!(forwards[0].host_port, busy_port);
        assert!(forwards[0].host_port >= fallback_start);
    }

    #[tokio::test]
    async fn test_require_local_port_fails_when_busy() {
        let busy = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let config = config(&format!(
            r#"{{"image": "a", "forwardPorts": [{p}],
                "portsAttributes": {{"{p}": {{"requireLocalPort": true}}}}}}"#,
            p = busy_port
        ));

        let manager = PortForwardManager::new(PortRange::default());
        let result = manager.plan_forwards("env", &config, &BTreeMap::new()).await;
        assert!(matches!(result, Err(ForgeError::PortForward(_))));
    }

    #[tokio::test]
    async fn test_ignored_ports_and_previous_bindings() {
        let config = config(
            r#"{"image": "a", "forwardPorts": [5000, 9229],
                "portsAttributes": {"9229": {"onAutoForward": "ignore"}}}"#,
        );
        let previous = BTreeMap::from([("5000".to_string(), 15000)]);

        let manager = PortForwardManager::new(PortRange::default());
        let forwards = manager.plan_forwards("env", &config, &previous).await.unwrap();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].host_port, 15000);
        assert_eq!(forwards[0].on_auto_forward, OnAutoForward::Notify);
    }

    #[tokio::test]
    async fn test_await_activation() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let forward = PortForward {
            port: ForwardPort::Local(port),
            host_port: port,
            label: None,
            on_auto_forward: OnAutoForward::Notify,
            protocol: PortProtocol::Http,
        };

        let active = PortForwardManager::await_activation(
            &forward,
            Duration::from_secs(2),
            Duration::from_millis(20),
        )
        .await;
        assert!(active);

        drop(listener);
        let closed = PortForward {
            host_port: free_port().await,
            ..forward
        };
        let active = PortForwardManager::await_activation(
            &closed,
            Duration::from_millis(100),
            Duration::from_millis(20),
        )
        .await;
        assert!(!active);
    }

    #[test]
    fn test_open_browser_once() {
        let forward = PortForward {
            port: ForwardPort::Local(5000),
            host_port: 5000,
            label: Some("Flask App".into()),
            on_auto_forward: OnAutoForward::OpenBrowserOnce,
            protocol: PortProtocol::Https,
        };
        assert_eq!(
            PortForwardManager::auto_forward_action(&forward, &BTreeSet::new()),
            AutoForwardAction::OpenBrowser("https://localhost:5000".into())
        );
        assert_eq!(
            PortForwardManager::auto_forward_action(&forward, &BTreeSet::from([5000])),
            AutoForwardAction::None
        );
        assert_eq!(forward.display_label(), "Flask App (5000)");
    }
}
