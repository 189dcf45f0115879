use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::app::config::SessionConfig;

use super::slot::ConnectionSlot;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("为目标 '{target}' 创建会话失败（尝试 {attempts} 次）: {reason}")]
    Creation {
        target: String,
        attempts: u32,
        reason: String,
    },
}

/// 绑定到某个容器端点的一次 CDP 会话。
/// 代理是会话级的：每个会话有自己的浏览器上下文，轮换代理时换会话不换容器
#[derive(Debug)]
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    context_id: Option<BrowserContextId>,
    event_task: JoinHandle<()>,
}

impl BrowserSession {
    pub fn page(&self) -> &Page {
        &self.page
    }
}

pub struct SessionSupervisor {
    host_network: String,
    proxy_enabled: bool,
    max_attempts: u32,
    retry_interval: Duration,
    user_agent: Option<String>,
}

impl SessionSupervisor {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            host_network: cfg.host_network.clone(),
            proxy_enabled: cfg.proxy,
            max_attempts: cfg.retry_attempts.max(1),
            retry_interval: Duration::from_millis(cfg.retry_interval_ms),
            user_agent: cfg.user_agent.clone(),
        }
    }

    /// 对着槽位的容器端点建会话，固定间隔重试，尝试次数有上限
    pub async fn start(
        &self,
        slot: &ConnectionSlot,
        proxy_url: Option<&str>,
    ) -> Result<BrowserSession, SessionError> {
        let endpoint = format!("{}:{}", self.host_network, slot.port());
        let proxy = if self.proxy_enabled { proxy_url } else { None };

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.try_create(&endpoint, proxy).await {
                Ok(session) => {
                    info!("'{}' 的会话已建立 ({})", slot.name(), endpoint);
                    return Ok(session);
                }
                Err(e) => {
                    warn!(
                        "第 {} 次尝试为 '{}' 创建会话失败: {:#}",
                        attempt,
                        slot.name(),
                        e
                    );
                    last_error = format!("{:#}", e);
                    if attempt < self.max_attempts {
                        sleep(self.retry_interval).await;
                    }
                }
            }
        }
        Err(SessionError::Creation {
            target: slot.name().to_string(),
            attempts: self.max_attempts,
            reason: last_error,
        })
    }

    async fn try_create(
        &self,
        endpoint: &str,
        proxy_url: Option<&str>,
    ) -> Result<BrowserSession> {
        let (browser, mut handler) = Browser::connect(endpoint)
            .await
            .context("连接浏览器失败")?;

        // 在后台消化浏览器事件，会话停掉时一起终止
        let event_task = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let context_id = match proxy_url {
            Some(proxy) => {
                let mut params = CreateBrowserContextParams::default();
                params.proxy_server = Some(proxy.to_string());
                let resp = browser
                    .execute(params)
                    .await
                    .context("创建浏览器上下文失败")?;
                Some(resp.result.browser_context_id.clone())
            }
            None => None,
        };

        let mut target: CreateTargetParams = "about:blank".into();
        target.browser_context_id = context_id.clone();
        let page = browser.new_page(target).await.context("创建页面失败")?;

        if let Some(ua) = &self.user_agent {
            page.set_user_agent(SetUserAgentOverrideParams::new(ua.clone()))
                .await
                .context("设置 User-Agent 失败")?;
        }

        Ok(BrowserSession {
            browser,
            page,
            context_id,
            event_task,
        })
    }

    /// 尽力而为地终止会话：失败只记日志，绝不上抛。
    /// 只断开本会话的页面和上下文，容器里的浏览器继续运行
    pub async fn stop(&self, session: BrowserSession) {
        let BrowserSession {
            browser,
            page,
            context_id,
            event_task,
        } = session;

        if let Err(e) = page.close().await {
            warn!("关闭页面失败: {}", e);
        }
        if let Some(ctx) = context_id {
            if let Err(e) = browser.execute(DisposeBrowserContextParams::new(ctx)).await {
                warn!("销毁浏览器上下文失败: {}", e);
            }
        }
        event_task.abort();
        drop(browser);
        debug!("会话已终止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::SessionConfig;

    #[tokio::test]
    async fn test_start_fails_after_bounded_attempts() {
        let cfg = SessionConfig {
            host_network: "http://127.0.0.1".to_string(),
            proxy: false,
            retry_attempts: 2,
            retry_interval_ms: 10,
            user_agent: None,
        };
        let sup = SessionSupervisor::new(&cfg);
        // 端口 1 上没有浏览器在听，连接会快速失败
        let slot = ConnectionSlot::new("demo", 1);

        let err = sup.start(&slot, None).await.unwrap_err();
        let SessionError::Creation {
            target, attempts, ..
        } = err;
        assert_eq!(target, "demo");
        assert_eq!(attempts, 2, "重试次数必须有上限");
    }

    #[test]
    fn test_proxy_disabled_ignores_proxy_url() {
        let cfg = SessionConfig {
            proxy: false,
            ..SessionConfig::default()
        };
        let sup = SessionSupervisor::new(&cfg);
        assert!(!sup.proxy_enabled);
    }

    #[test]
    fn test_zero_retry_attempts_clamped_to_one() {
        let cfg = SessionConfig {
            retry_attempts: 0,
            ..SessionConfig::default()
        };
        let sup = SessionSupervisor::new(&cfg);
        assert_eq!(sup.max_attempts, 1);
    }
}
