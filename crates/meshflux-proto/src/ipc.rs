//! Local command channel between the tunnel process and its controllers
//!
//! The tunnel process listens on a Unix domain socket in its base directory;
//! the host application or the operator CLI connects to query status or send
//! commands. Messages are newline-delimited JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Request sent to the tunnel process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Check that the command server is alive
    Ping,

    /// Service and network-settings status
    Status,

    /// Rebuild the configuration and reload the running service
    Reload,

    /// Stop the engine service, keeping the command server up
    StopService,

    /// Current system proxy status
    GetSystemProxy,

    /// Enable or disable the system proxy
    SetSystemProxy { enabled: bool },
}

/// Response sent back by the tunnel process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Status(ServiceStatusInfo),

    SystemProxy { available: bool, enabled: bool },

    /// Success acknowledgment
    Ok { message: Option<String> },

    /// Error response
    Error { message: String },

    /// Pong response to ping
    Pong,
}

/// Status of the engine service and the applied network settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceStatusInfo {
    pub service_running: bool,
    /// `None` until the engine opened the tunnel
    pub settings: Option<SettingsSummary>,
    pub proxy_available: bool,
    pub proxy_enabled: bool,
}

/// Display-oriented digest of the applied network settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsSummary {
    pub mtu: Option<u32>,
    pub dns_servers: Vec<String>,
    pub ipv4_addresses: Vec<String>,
    pub ipv6_addresses: Vec<String>,
    pub included_routes: usize,
    pub excluded_routes: usize,
    /// `host:port` of the HTTP proxy, if configured
    pub http_proxy: Option<String>,
}

/// Client side of the command channel
pub struct IpcClient {
    stream: BufReader<UnixStream>,
}

impl IpcClient {
    /// Connect to the command socket at `path`
    pub async fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to command socket at {:?}", path))?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send a request and receive a response
    pub async fn request(&mut self, req: &IpcRequest) -> Result<IpcResponse> {
        let mut json = serde_json::to_string(req)?;
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send request")?;

        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush request")?;

        let mut response_line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut response_line)
            .await
            .context("Failed to read response")?;

        if bytes_read == 0 {
            anyhow::bail!("Command server closed the connection");
        }

        serde_json::from_str(&response_line).context("Failed to parse response")
    }
}

/// Listening side of the command channel
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind to the command socket at `path`.
    ///
    /// A leftover socket file from a crashed instance is removed; a socket
    /// that still accepts connections is reported as an error so the caller
    /// can retry once the other instance has gone away.
    pub async fn bind_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            match UnixStream::connect(path).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another command server is already running (socket at {:?} is active)",
                        path
                    );
                }
                Err(_) => {
                    std::fs::remove_file(path)
                        .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
                }
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind to socket at {:?}", path))?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection {
            stream: BufReader::new(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// A single connection from a controller
pub struct IpcConnection {
    stream: BufReader<UnixStream>,
}

impl IpcConnection {
    /// Receive the next request, `Ok(None)` once the peer hung up
    pub async fn recv(&mut self) -> Result<Option<IpcRequest>> {
        let mut line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut line)
            .await
            .context("Failed to read request")?;

        if bytes_read == 0 {
            return Ok(None);
        }

        let request = serde_json::from_str(&line).context("Failed to parse request")?;
        Ok(Some(request))
    }

    /// Send a response to the controller
    pub async fn send(&mut self, response: &IpcResponse) -> Result<()> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send response")?;

        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush response")?;

        Ok(())
    }
}

/// Render a status response for terminal output
pub fn format_status(status: &ServiceStatusInfo) -> String {
    let mut lines = vec![format!(
        "Service:  {}",
        if status.service_running {
            "● running"
        } else {
            "○ stopped"
        }
    )];

    match &status.settings {
        Some(settings) => {
            let mtu = settings
                .mtu
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!("MTU:      {}", mtu));
            lines.push(format!("DNS:      {}", join_or_dash(&settings.dns_servers)));
            lines.push(format!("IPv4:     {}", join_or_dash(&settings.ipv4_addresses)));
            lines.push(format!("IPv6:     {}", join_or_dash(&settings.ipv6_addresses)));
            lines.push(format!(
                "Routes:   {} included, {} excluded",
                settings.included_routes, settings.excluded_routes
            ));
        }
        None => lines.push("Tunnel:   not open".to_string()),
    }

    let proxy = match (status.proxy_available, status.proxy_enabled) {
        (false, _) => "unavailable",
        (true, true) => "enabled",
        (true, false) => "disabled",
    };
    lines.push(format!("Proxy:    {}", proxy));

    lines.join("\n")
}

fn join_or_dash(values: &[String]) -> String {
    if values.is_empty() {
        "-".to_string()
    } else {
        values.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_request_serialization() {
        let json = serde_json::to_string(&IpcRequest::Status).unwrap();
        assert_eq!(json, r#"{"type":"status"}"#);

        let json = serde_json::to_string(&IpcRequest::StopService).unwrap();
        assert_eq!(json, r#"{"type":"stop_service"}"#);

        let json = serde_json::to_string(&IpcRequest::SetSystemProxy { enabled: true }).unwrap();
        assert_eq!(json, r#"{"type":"set_system_proxy","enabled":true}"#);

        let req: IpcRequest = serde_json::from_str(r#"{"type":"reload"}"#).unwrap();
        assert_eq!(req, IpcRequest::Reload);
    }

    #[test]
    fn test_ipc_response_serialization() {
        let resp = IpcResponse::SystemProxy {
            available: true,
            enabled: false,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"type":"system_proxy","available":true,"enabled":false}"#
        );

        let resp = IpcResponse::Status(ServiceStatusInfo {
            service_running: true,
            settings: None,
            proxy_available: false,
            proxy_enabled: false,
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""service_running":true"#));

        let json = r#"{"type":"error","message":"Something went wrong"}"#;
        let resp: IpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            resp,
            IpcResponse::Error {
                message: "Something went wrong".to_string()
            }
        );
    }

    #[test]
    fn test_format_status() {
        let status = ServiceStatusInfo {
            service_running: true,
            settings: Some(SettingsSummary {
                mtu: Some(9000),
                dns_servers: vec!["172.18.0.2".to_string()],
                ipv4_addresses: vec!["172.18.0.1/30".to_string()],
                ipv6_addresses: vec![],
                included_routes: 8,
                excluded_routes: 0,
                http_proxy: None,
            }),
            proxy_available: true,
            proxy_enabled: false,
        };

        let text = format_status(&status);
        assert!(text.contains("● running"));
        assert!(text.contains("MTU:      9000"));
        assert!(text.contains("IPv6:     -"));
        assert!(text.contains("8 included, 0 excluded"));
        assert!(text.contains("Proxy:    disabled"));
    }

    mod unix_tests {
        use super::*;
        use tempfile::TempDir;

        #[tokio::test]
        async fn test_ipc_client_server_roundtrip() {
            let temp_dir = TempDir::new().unwrap();
            let socket_path = temp_dir.path().join("command.sock");

            let server = IpcServer::bind_to(&socket_path).await.unwrap();

            let server_handle = tokio::spawn(async move {
                let mut conn = server.accept().await.unwrap();
                let request = conn.recv().await.unwrap();

                let response = match request {
                    Some(IpcRequest::Ping) => IpcResponse::Pong,
                    _ => IpcResponse::Error {
                        message: "Unknown request".to_string(),
                    },
                };

                conn.send(&response).await.unwrap();
            });

            let mut client = IpcClient::connect_to(&socket_path).await.unwrap();
            let response = client.request(&IpcRequest::Ping).await.unwrap();

            assert_eq!(response, IpcResponse::Pong);

            server_handle.await.unwrap();
        }

        #[tokio::test]
        async fn test_ipc_stale_socket_cleanup() {
            let temp_dir = TempDir::new().unwrap();
            let socket_path = temp_dir.path().join("stale.sock");

            // Not a live socket, just a leftover file
            std::fs::write(&socket_path, "stale").unwrap();

            let server = IpcServer::bind_to(&socket_path).await.unwrap();
            assert!(socket_path.exists());

            drop(server);

            assert!(!socket_path.exists());
        }

        #[tokio::test]
        async fn test_ipc_bind_rejects_live_socket_until_released() {
            let temp_dir = TempDir::new().unwrap();
            let socket_path = temp_dir.path().join("busy.sock");

            let first = IpcServer::bind_to(&socket_path).await.unwrap();
            assert!(IpcServer::bind_to(&socket_path).await.is_err());

            drop(first);

            // Retrying after the previous owner went away succeeds
            assert!(IpcServer::bind_to(&socket_path).await.is_ok());
        }

        #[tokio::test]
        async fn test_ipc_multiple_requests() {
            let temp_dir = TempDir::new().unwrap();
            let socket_path = temp_dir.path().join("multi.sock");

            let server = IpcServer::bind_to(&socket_path).await.unwrap();

            let server_handle = tokio::spawn(async move {
                let mut conn = server.accept().await.unwrap();

                let req1 = conn.recv().await.unwrap();
                assert_eq!(req1, Some(IpcRequest::Ping));
                conn.send(&IpcResponse::Pong).await.unwrap();

                let req2 = conn.recv().await.unwrap();
                assert_eq!(req2, Some(IpcRequest::Reload));
                conn.send(&IpcResponse::Ok {
                    message: Some("Reloaded".to_string()),
                })
                .await
                .unwrap();

                // Client hung up
                assert_eq!(conn.recv().await.unwrap(), None);
            });

            let mut client = IpcClient::connect_to(&socket_path).await.unwrap();

            let resp1 = client.request(&IpcRequest::Ping).await.unwrap();
            assert_eq!(resp1, IpcResponse::Pong);

            let resp2 = client.request(&IpcRequest::Reload).await.unwrap();
            assert_eq!(
                resp2,
                IpcResponse::Ok {
                    message: Some("Reloaded".to_string())
                }
            );

            drop(client);
            server_handle.await.unwrap();
        }
    }
}
