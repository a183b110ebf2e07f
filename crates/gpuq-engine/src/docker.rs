use std::collections::HashMap;

use futures_util::StreamExt;
use gpuq_domain::ContainerId;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{
    ContainerEngine, ContainerLimits, ContainerStatus, LogLines, OneoffSpec, SessionSpec,
};
use crate::error::EngineError;
use crate::logmux::LogDemux;

use async_trait::async_trait;

/// Capacity of the per-stream line channel. A slow consumer backpressures the
/// pump, which backpressures the engine connection.
const LOG_CHANNEL_CAPACITY: usize = 64;

/// Container path the model directory is mounted at in session containers.
const MODEL_MOUNT_PATH: &str = "/models";

/// [`ContainerEngine`] implementation over the engine daemon's HTTP API.
///
/// The service runs as a sibling of the containers it creates: it talks to
/// the host daemon and passes devices through by numeric id. The base URL is
/// injectable so tests can point it at a mock server.
pub struct DockerEngine {
    base: String,
    client: reqwest::Client,
    limits: ContainerLimits,
}

impl DockerEngine {
    pub fn new(base_url: impl Into<String>, limits: ContainerLimits) -> Self {
        Self {
            base: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            limits,
        }
    }

    /// Connectivity check, called once at startup.
    pub async fn ping(&self) -> Result<(), EngineError> {
        let resp = self.client.get(format!("{}/_ping", self.base)).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::Api {
                status: resp.status().as_u16(),
                message: "engine ping failed".to_string(),
            });
        }
        Ok(())
    }

    /// Extract the `message` field of an engine error body.
    async fn error_message(resp: reqwest::Response) -> String {
        let status = resp.status();
        match resp.json::<Value>().await {
            Ok(body) => body["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status)),
            Err(_) => format!("HTTP {}", status),
        }
    }

    async fn create_and_start(
        &self,
        name: &str,
        body: Value,
    ) -> Result<ContainerId, EngineError> {
        let resp = self
            .client
            .post(format!("{}/containers/create?name={}", self.base, name))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(EngineError::CreateFailed(Self::error_message(resp).await));
        }

        let created: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        let id = created["Id"]
            .as_str()
            .ok_or_else(|| EngineError::Decode("create response missing Id".to_string()))?
            .to_string();
        let id = ContainerId::new(id);

        let resp = self
            .client
            .post(format!("{}/containers/{}/start", self.base, id))
            .send()
            .await?;
        if !resp.status().is_success() {
            let message = Self::error_message(resp).await;
            // The created-but-unstartable container would otherwise leak.
            let _ = self.remove(&id, true).await;
            return Err(EngineError::CreateFailed(message));
        }

        Ok(id)
    }

    fn host_config(&self, device_id: u32, auto_remove: bool, binds: Vec<String>) -> Value {
        json!({
            "AutoRemove": auto_remove,
            "Memory": self.limits.memory_bytes,
            "CpuQuota": self.limits.cpu_quota,
            "Binds": binds,
            "DeviceRequests": [{
                "Driver": "nvidia",
                "DeviceIDs": [device_id.to_string()],
                "Capabilities": [["gpu"]],
            }],
        })
    }
}

fn env_list(env: &HashMap<String, String>) -> Vec<String> {
    let mut list: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    list.sort();
    list
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_oneoff(&self, spec: &OneoffSpec) -> Result<ContainerId, EngineError> {
        debug!(task_id = %spec.task_id, device_id = %spec.device_id, "creating one-off container");

        let mut env = spec.env.clone();
        env.insert("TASK_ID".to_string(), spec.task_id.to_string());

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|(host, container)| format!("{}:{}:rw", host.display(), container))
            .collect();

        let body = json!({
            "Image": spec.image,
            "Cmd": spec.command,
            "Env": env_list(&env),
            "Labels": {
                "gpuq.task_id": spec.task_id.as_str(),
                "gpuq.class": spec.class.to_string(),
                "gpuq.device_id": spec.device_id.to_string(),
                "gpuq.kind": "oneoff",
            },
            "HostConfig": self.host_config(spec.device_id.as_u32(), true, binds),
        });

        let id = self
            .create_and_start(&format!("gpuq-task-{}", spec.task_id.short()), body)
            .await?;
        debug!(task_id = %spec.task_id, container_id = %id.short(), "one-off container started");
        Ok(id)
    }

    async fn create_session(&self, spec: &SessionSpec) -> Result<ContainerId, EngineError> {
        debug!(session_id = %spec.session_id, device_id = %spec.device_id, "creating session container");

        let mut env = spec.env.clone();
        env.insert("SESSION_ID".to_string(), spec.session_id.to_string());
        env.insert("MODEL_PATH".to_string(), MODEL_MOUNT_PATH.to_string());

        let binds = vec![format!(
            "{}:{}:ro",
            spec.model_host_path.display(),
            MODEL_MOUNT_PATH
        )];

        let body = json!({
            "Image": spec.image,
            "Cmd": spec.command,
            "Env": env_list(&env),
            "OpenStdin": true,
            "Labels": {
                "gpuq.session_id": spec.session_id.as_str(),
                "gpuq.model_id": spec.model_id.as_str(),
                "gpuq.device_id": spec.device_id.to_string(),
                "gpuq.kind": "session",
            },
            "HostConfig": self.host_config(spec.device_id.as_u32(), false, binds),
        });

        let id = self
            .create_and_start(&format!("gpuq-session-{}", spec.session_id.short()), body)
            .await?;
        debug!(session_id = %spec.session_id, container_id = %id.short(), "session container started");
        Ok(id)
    }

    async fn exec(&self, id: &ContainerId, command: &[String]) -> Result<String, EngineError> {
        let resp = self
            .client
            .post(format!("{}/containers/{}/exec", self.base, id))
            .json(&json!({
                "AttachStdout": true,
                "AttachStderr": true,
                "Cmd": command,
            }))
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(EngineError::Api { status, message: Self::error_message(resp).await });
        }

        let created: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        let exec_id = created["Id"]
            .as_str()
            .ok_or_else(|| EngineError::Decode("exec response missing Id".to_string()))?;

        let resp = self
            .client
            .post(format!("{}/exec/{}/start", self.base, exec_id))
            .json(&json!({ "Detach": false, "Tty": false }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(EngineError::Api { status, message: Self::error_message(resp).await });
        }

        let bytes = resp.bytes().await?;
        let mut mux = LogDemux::new();
        let mut lines = mux.push(&bytes);
        if let Some(tail) = mux.finish() {
            lines.push(tail);
        }
        Ok(lines.join("\n"))
    }

    async fn stream_logs(&self, id: &ContainerId, follow: bool) -> Result<LogLines, EngineError> {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);

        let resp = self
            .client
            .get(format!(
                "{}/containers/{}/logs?follow={}&stdout=true&stderr=true&timestamps=false",
                self.base, id, follow
            ))
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            warn!(container_id = %id.short(), "log stream requested for unknown container");
            return Ok(rx); // sender dropped: empty, finished stream
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(EngineError::Api { status, message: Self::error_message(resp).await });
        }

        let container_id = id.clone();
        tokio::spawn(async move {
            let mut mux = LogDemux::new();
            let mut stream = resp.bytes_stream();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(container_id = %container_id.short(), error = %e, "log stream ended with error");
                        break;
                    }
                };
                for line in mux.push(&chunk) {
                    if tx.send(line).await.is_err() {
                        // Consumer gone (client disconnect); stop pumping.
                        return;
                    }
                }
            }

            if let Some(tail) = mux.finish() {
                let _ = tx.send(tail).await;
            }
        });

        Ok(rx)
    }

    async fn stop(&self, id: &ContainerId, grace_seconds: u64) -> Result<(), EngineError> {
        let resp = self
            .client
            .post(format!("{}/containers/{}/stop?t={}", self.base, id, grace_seconds))
            .send()
            .await?;

        match resp.status().as_u16() {
            204 | 304 => Ok(()),
            404 => {
                warn!(container_id = %id.short(), "stop requested for unknown container (already removed?)");
                Ok(())
            }
            status => Err(EngineError::Api { status, message: Self::error_message(resp).await }),
        }
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), EngineError> {
        let resp = self
            .client
            .delete(format!("{}/containers/{}?force={}", self.base, id, force))
            .send()
            .await?;

        match resp.status().as_u16() {
            204 => Ok(()),
            404 => {
                warn!(container_id = %id.short(), "remove requested for unknown container (already removed?)");
                Ok(())
            }
            status => Err(EngineError::Api { status, message: Self::error_message(resp).await }),
        }
    }

    async fn status(&self, id: &ContainerId) -> Result<Option<ContainerStatus>, EngineError> {
        let resp = self
            .client
            .get(format!("{}/containers/{}/json", self.base, id))
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            warn!(container_id = %id.short(), "status requested for unknown container");
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(EngineError::Api { status, message: Self::error_message(resp).await });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        let state = &body["State"];
        Ok(Some(ContainerStatus {
            id: ContainerId::new(body["Id"].as_str().unwrap_or(id.as_str())),
            status: state["Status"].as_str().unwrap_or("unknown").to_string(),
            started_at: state["StartedAt"].as_str().map(str::to_string),
            finished_at: state["FinishedAt"].as_str().map(str::to_string),
            exit_code: state["ExitCode"].as_i64(),
        }))
    }
}
