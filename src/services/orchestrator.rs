use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::app::config::AppConfig;
use crate::browser::container::ContainerSupervisor;
use crate::browser::proxy::{ProxyError, ProxyPool};
use crate::browser::session::SessionSupervisor;
use crate::browser::slot::ConnectionSlot;
use crate::services::types::{ProvisionStage, ProvisioningReport, SlotOutcome};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("找不到目标 '{0}' 的连接")]
    UnknownTarget(String),
    #[error("目标 '{0}' 还没有可用的会话")]
    NotConnected(String),
}

/// 编排器：独占所有连接槽和三个管理器，按目标顺序串行推进
/// 连接、请求、轮换、断开。跨层的恢复策略只有一条：代理用尽就轮换
pub struct Orchestrator {
    proxies: ProxyPool,
    containers: ContainerSupervisor,
    sessions: SessionSupervisor,
    slots: Vec<ConnectionSlot>,
}

/// 按配置把槽位和三个管理器组装成编排器。
/// 端口按目标顺序逐个消费，数量在配置加载时已经校验过
pub async fn setup_orchestrator(cfg: &AppConfig) -> Result<Orchestrator> {
    let mut ports = cfg.docker.ports.iter().copied();
    let mut slots = Vec::with_capacity(cfg.targets.len());
    for target in &cfg.targets {
        let port = ports.next().context("配置的端口数量不足")?;
        slots.push(ConnectionSlot::new(target.name.clone(), port));
    }

    let proxies = ProxyPool::initialize(&cfg.proxy).await?;
    let containers = ContainerSupervisor::new(&cfg.docker)?;
    let sessions = SessionSupervisor::new(&cfg.session);

    Ok(Orchestrator::new(proxies, containers, sessions, slots))
}

impl Orchestrator {
    pub fn new(
        proxies: ProxyPool,
        containers: ContainerSupervisor,
        sessions: SessionSupervisor,
        slots: Vec<ConnectionSlot>,
    ) -> Self {
        Self {
            proxies,
            containers,
            sessions,
            slots,
        }
    }

    /// 为每个槽位依次拿代理、起容器、建会话。
    /// 单个目标失败只影响自己：已拿到的资源退回去，然后继续下一个目标
    pub async fn connect(&mut self) -> ProvisioningReport {
        let mut report = ProvisioningReport::default();
        for idx in 0..self.slots.len() {
            let name = self.slots[idx].name().to_string();
            match self.provision_slot(idx).await {
                Ok(()) => {
                    info!("✅ 目标 '{}' 已就绪", name);
                    report.record(name, SlotOutcome::Connected);
                }
                Err((stage, reason)) => {
                    error!("目标 '{}' 连接失败（{}）: {}", name, stage, reason);
                    report.record(name, SlotOutcome::Failed { stage, reason });
                }
            }
        }
        report
    }

    async fn provision_slot(&mut self, idx: usize) -> std::result::Result<(), (ProvisionStage, String)> {
        let proxy = self
            .proxies
            .acquire()
            .await
            .map_err(|e| (ProvisionStage::Proxy, e.to_string()))?;
        self.slots[idx].proxy = Some(proxy.clone());

        let container = match self.containers.start(&self.slots[idx]).await {
            Ok(container) => container,
            Err(e) => {
                self.slots[idx].proxy = None;
                self.proxies.release(&proxy);
                return Err((ProvisionStage::Container, e.to_string()));
            }
        };
        self.slots[idx].container = Some(container);

        let proxy_url = self.proxies.connection_url(&proxy);
        match self.sessions.start(&self.slots[idx], Some(&proxy_url)).await {
            Ok(session) => {
                self.slots[idx].session = Some(session);
                Ok(())
            }
            Err(e) => {
                if let Some(container) = self.slots[idx].container.take() {
                    if let Err(cleanup_err) = self.containers.cleanup(&container).await {
                        warn!("回收容器 '{}' 失败: {}", container.name, cleanup_err);
                    }
                }
                self.slots[idx].proxy = None;
                self.proxies.release(&proxy);
                Err((ProvisionStage::Session, e.to_string()))
            }
        }
    }

    /// 把所有槽位拆干净。每一步失败都只记日志，保证每个槽位都走到
    pub async fn disconnect(&mut self) {
        for idx in 0..self.slots.len() {
            if let Some(session) = self.slots[idx].session.take() {
                self.sessions.stop(session).await;
            }
            if let Some(container) = self.slots[idx].container.take() {
                if let Err(e) = self.containers.cleanup(&container).await {
                    warn!("断开时回收容器 '{}' 失败: {}", container.name, e);
                }
            }
            if let Some(proxy) = self.slots[idx].proxy.take() {
                self.proxies.release(&proxy);
            }
        }
        info!("所有连接已断开");
    }

    pub fn get_connection(&self, target: &str) -> Result<&ConnectionSlot, OrchestratorError> {
        self.slots
            .iter()
            .find(|slot| slot.name() == target)
            .ok_or_else(|| OrchestratorError::UnknownTarget(target.to_string()))
    }

    fn slot_index(&self, target: &str) -> Result<usize, OrchestratorError> {
        self.slots
            .iter()
            .position(|slot| slot.name() == target)
            .ok_or_else(|| OrchestratorError::UnknownTarget(target.to_string()))
    }

    /// 驱动目标的会话访问 url。导航失败只记日志（尽力而为）；
    /// 代理用尽时轮换并重试导航，最多多试一次，绝不递归
    pub async fn make_request(&mut self, target: &str, url: &str) -> Result<(), OrchestratorError> {
        let idx = self.slot_index(target)?;
        if self.slots[idx].session.is_none() {
            return Err(OrchestratorError::NotConnected(target.to_string()));
        }

        self.request_loop(idx, url, async |slot, url| {
            // 轮换失败后槽位已降级，会话可能已经不在了
            let session = slot.session.as_ref().context("会话不可用")?;
            session.page().goto(url).await.context("导航失败")?;
            Ok(())
        })
        .await;
        Ok(())
    }

    /// 导航、记账、轮换的决策循环。导航动作由调用方给进来
    async fn request_loop<N>(&mut self, idx: usize, url: &str, mut navigate: N)
    where
        N: AsyncFnMut(&ConnectionSlot, &str) -> Result<()>,
    {
        let name = self.slots[idx].name().to_string();
        let mut rotated = false;
        loop {
            if let Err(e) = navigate(&self.slots[idx], url).await {
                error!("目标 '{}' 请求 '{}' 失败: {:#}", name, url, e);
                return;
            }

            let Some(proxy) = self.slots[idx].proxy.clone() else {
                return;
            };
            match self.proxies.record_use(&proxy) {
                Ok(()) => return,
                Err(ProxyError::UsageLimitExceeded(_)) if !rotated => {
                    info!("代理 '{}' 已用尽，为 '{}' 轮换后重试一次", proxy, name);
                    rotated = true;
                    self.rotate_slot(idx).await;
                }
                Err(e) => {
                    error!("记录代理使用失败: {}", e);
                    return;
                }
            }
        }
    }

    /// 换代理不换容器：拿新代理、停旧会话、对同一容器建新会话，
    /// 新会话确认可用后才改写槽位
    pub async fn rotate_proxy(&mut self, target: &str) -> Result<(), OrchestratorError> {
        let idx = self.slot_index(target)?;
        self.rotate_slot(idx).await;
        Ok(())
    }

    async fn rotate_slot(&mut self, idx: usize) {
        let name = self.slots[idx].name().to_string();
        let new_proxy = match self.proxies.acquire().await {
            Ok(proxy) => proxy,
            Err(e) => {
                error!("为 '{}' 轮换代理失败（获取新代理）: {}", name, e);
                return;
            }
        };

        // 旧会话先停掉；旧代理用尽时已被池淘汰，主动轮换时才需要退回
        if let Some(old_session) = self.slots[idx].session.take() {
            self.sessions.stop(old_session).await;
        }

        let proxy_url = self.proxies.connection_url(&new_proxy);
        match self.sessions.start(&self.slots[idx], Some(&proxy_url)).await {
            Ok(session) => {
                if let Some(old_proxy) = self.slots[idx].proxy.take() {
                    self.proxies.release(&old_proxy);
                }
                self.slots[idx].proxy = Some(new_proxy);
                self.slots[idx].session = Some(session);
                info!("'{}' 已轮换代理", name);
            }
            Err(e) => {
                self.proxies.release(&new_proxy);
                error!("为 '{}' 轮换代理失败，槽位已降级: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::{DockerConfig, SessionConfig};

    fn test_orchestrator(slots: Vec<ConnectionSlot>) -> Orchestrator {
        let proxies = ProxyPool::with_entries(&["1.1.1.1:80", "2.2.2.2:80"], 3);
        let containers =
            ContainerSupervisor::new(&DockerConfig::default()).expect("应该能构造容器管理器");
        let sessions = SessionSupervisor::new(&SessionConfig::default());
        Orchestrator::new(proxies, containers, sessions, slots)
    }

    #[test]
    fn test_get_connection_unknown_target() {
        let orchestrator = test_orchestrator(vec![ConnectionSlot::new("books", 9051)]);
        let err = orchestrator.get_connection("missing").unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTarget(name) if name == "missing"));
    }

    #[test]
    fn test_get_connection_returns_slot() {
        let orchestrator = test_orchestrator(vec![ConnectionSlot::new("books", 9051)]);
        let slot = orchestrator.get_connection("books").unwrap();
        assert_eq!(slot.port(), 9051);
        assert!(!slot.is_connected());
    }

    #[tokio::test]
    async fn test_make_request_requires_a_session() {
        let mut orchestrator = test_orchestrator(vec![ConnectionSlot::new("books", 9051)]);
        let err = orchestrator
            .make_request("books", "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotConnected(name) if name == "books"));
    }

    #[tokio::test]
    async fn test_make_request_unknown_target() {
        let mut orchestrator = test_orchestrator(Vec::new());
        let err = orchestrator
            .make_request("missing", "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn test_usage_limit_rotates_once_and_retries_once() {
        // 上限 2：acquire 已计 1 次，循环里的 record_use 到 2 就触发淘汰
        let proxies = ProxyPool::with_entries(&["1.1.1.1:80", "2.2.2.2:80"], 2);
        let containers =
            ContainerSupervisor::new(&DockerConfig::default()).expect("应该能构造容器管理器");
        // 端口 1 上没有浏览器在听，轮换里的建会话会快速失败
        let sessions = SessionSupervisor::new(&SessionConfig {
            retry_attempts: 1,
            retry_interval_ms: 10,
            ..SessionConfig::default()
        });
        let mut orchestrator = Orchestrator::new(
            proxies,
            containers,
            sessions,
            vec![ConnectionSlot::new("books", 1)],
        );
        let first = orchestrator.proxies.acquire().await.unwrap();
        assert_eq!(first, "1.1.1.1:80");
        orchestrator.slots[0].proxy = Some(first);

        let mut navigations = 0u32;
        orchestrator
            .request_loop(0, "https://example.com", async |_, _| {
                navigations += 1;
                Ok(())
            })
            .await;

        assert_eq!(navigations, 2, "用尽后应该恰好重试一次导航");
        assert!(
            orchestrator.proxies.entry_state("1.1.1.1:80").is_none(),
            "用尽的代理应该已被淘汰"
        );
        assert_eq!(
            orchestrator.proxies.entry_state("2.2.2.2:80"),
            Some((1, false)),
            "轮换恰好取了一次新代理，建会话失败后退回池中"
        );
    }

    #[tokio::test]
    async fn test_request_below_limit_navigates_once_without_rotation() {
        let mut orchestrator = test_orchestrator(vec![ConnectionSlot::new("books", 9051)]);
        let first = orchestrator.proxies.acquire().await.unwrap();
        orchestrator.slots[0].proxy = Some(first.clone());

        let mut navigations = 0u32;
        orchestrator
            .request_loop(0, "https://example.com", async |_, _| {
                navigations += 1;
                Ok(())
            })
            .await;

        assert_eq!(navigations, 1);
        assert_eq!(orchestrator.proxies.entry_state(&first), Some((2, true)));
        assert_eq!(
            orchestrator.proxies.entry_state("2.2.2.2:80"),
            Some((0, false)),
            "没到上限不应该触发轮换"
        );
    }

    #[tokio::test]
    async fn test_failed_navigation_is_swallowed_and_not_counted() {
        let mut orchestrator = test_orchestrator(vec![ConnectionSlot::new("books", 9051)]);
        let first = orchestrator.proxies.acquire().await.unwrap();
        orchestrator.slots[0].proxy = Some(first.clone());

        orchestrator
            .request_loop(0, "https://example.com", async |_, _| {
                anyhow::bail!("导航超时")
            })
            .await;

        assert_eq!(
            orchestrator.proxies.entry_state(&first),
            Some((1, true)),
            "失败的导航不应该计使用"
        );
    }

    #[tokio::test]
    async fn test_disconnect_after_partial_connect_releases_proxy() {
        // 模拟部分连接：槽位拿到了代理，但容器和会话都没起来
        let mut orchestrator = test_orchestrator(vec![ConnectionSlot::new("books", 9051)]);
        let proxy = orchestrator.proxies.acquire().await.unwrap();
        orchestrator.slots[0].proxy = Some(proxy.clone());
        assert_eq!(orchestrator.proxies.entry_state(&proxy), Some((1, true)));

        orchestrator.disconnect().await;

        assert!(orchestrator.slots[0].proxy.is_none());
        assert_eq!(
            orchestrator.proxies.entry_state(&proxy),
            Some((1, false)),
            "断开后代理应该释放回池中"
        );
    }

    #[tokio::test]
    async fn test_disconnect_on_empty_slots_is_a_noop() {
        let mut orchestrator = test_orchestrator(vec![
            ConnectionSlot::new("a", 9051),
            ConnectionSlot::new("b", 9052),
        ]);
        // 什么都没连上时断开也不应该出错
        orchestrator.disconnect().await;
        orchestrator.disconnect().await;
    }
}
