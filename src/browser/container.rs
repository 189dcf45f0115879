use std::collections::HashMap;

use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use thiserror::Error;
use tracing::{info, warn};

use crate::app::config::DockerConfig;

use super::slot::ConnectionSlot;

/// 优雅停止的等待秒数
const STOP_TIMEOUT_SECS: i64 = 10;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("无法连接 Docker 守护进程: {0}")]
    Daemon(#[source] bollard::errors::Error),
    #[error("容器 '{name}' 启动失败: {source}")]
    Start {
        name: String,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("容器 '{name}' 停止失败: {source}")]
    Stop {
        name: String,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("容器 '{name}' 移除失败: {source}")]
    Remove {
        name: String,
        #[source]
        source: bollard::errors::Error,
    },
}

#[derive(Clone, Debug)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// 每个连接槽一个浏览器容器：容器内的 CDP 端口映射到槽位预分配的宿主端口
pub struct ContainerSupervisor {
    docker: Docker,
    image: String,
    automation_port: u16,
    shm_size: i64,
    network_mode: String,
    environment: HashMap<String, String>,
    option_args: Vec<String>,
    remove_on_cleanup: bool,
}

impl ContainerSupervisor {
    pub fn new(cfg: &DockerConfig) -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults().map_err(ContainerError::Daemon)?;
        Ok(Self {
            docker,
            image: cfg.container_image.clone(),
            automation_port: cfg.automation_port,
            shm_size: cfg.container_shm_size as i64,
            network_mode: cfg.network_mode.clone(),
            environment: cfg.environment.clone(),
            option_args: cfg.option_args.clone(),
            remove_on_cleanup: cfg.remove_on_cleanup,
        })
    }

    /// 创建并启动槽位的浏览器容器。这一层不做重试，重试策略归编排器
    pub async fn start(&self, slot: &ConnectionSlot) -> Result<ContainerHandle, ContainerError> {
        let name = slot.name().to_string();
        let port = slot.port();

        // 上一次运行可能留下同名容器，先强制清掉，否则创建会报 409
        let _ = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), self.container_config(port))
            .await
            .map_err(|e| ContainerError::Start {
                name: name.clone(),
                source: e,
            })?;
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::Start {
                name: name.clone(),
                source: e,
            })?;

        info!("'{}' 浏览器容器已在端口 {} 启动 (ID: {})", name, port, created.id);
        Ok(ContainerHandle {
            id: created.id,
            name,
        })
    }

    pub async fn stop(&self, handle: &ContainerHandle) -> Result<(), ContainerError> {
        self.docker
            .stop_container(
                &handle.name,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
            .map_err(|e| ContainerError::Stop {
                name: handle.name.clone(),
                source: e,
            })?;
        info!("容器 '{}' 已停止 (ID: {})", handle.name, handle.id);
        Ok(())
    }

    /// 移除容器；"已经不存在"只记日志，不当作错误
    pub async fn remove(&self, handle: &ContainerHandle) -> Result<(), ContainerError> {
        match self
            .docker
            .remove_container(&handle.name, None::<RemoveContainerOptions>)
            .await
        {
            Ok(()) => {
                info!("容器 '{}' 已移除 (ID: {})", handle.name, handle.id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!("容器 '{}' 不存在或已被移除", handle.name);
                Ok(())
            }
            Err(e) => Err(ContainerError::Remove {
                name: handle.name.clone(),
                source: e,
            }),
        }
    }

    pub async fn cleanup(&self, handle: &ContainerHandle) -> Result<(), ContainerError> {
        self.stop(handle).await?;
        if self.remove_on_cleanup {
            self.remove(handle).await?;
        }
        Ok(())
    }

    fn container_config(&self, host_port: u16) -> ContainerConfig<String> {
        let port_key = format!("{}/tcp", self.automation_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let env: Vec<String> = self
            .environment
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        // 镜像入口命令是浏览器本体，cmd 里的参数会追加到它后面
        let cmd = if self.option_args.is_empty() {
            None
        } else {
            Some(self.option_args.clone())
        };

        ContainerConfig {
            image: Some(self.image.clone()),
            cmd,
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                shm_size: Some(self.shm_size),
                network_mode: Some(self.network_mode.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
