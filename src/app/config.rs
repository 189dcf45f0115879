use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::browser::proxy::ProxyScheme;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
}

/// 一个抓取目标：名字唯一，urls 是要依次访问的链接
#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub name: String,
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_input_file")]
    pub input_file: PathBuf,
    #[serde(default = "default_proxy_test_url")]
    pub test_url: String,
    #[serde(default = "default_proxy_usage_limit")]
    pub usage_limit: u32,
    #[serde(default = "default_proxy_validation")]
    pub validation: bool,
    #[serde(default)]
    pub scheme: ProxyScheme,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// 每个目标按顺序占用一个端口
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default = "default_container_image")]
    pub container_image: String,
    /// 容器内的 CDP 调试端口
    #[serde(default = "default_automation_port")]
    pub automation_port: u16,
    /// 共享内存大小（字节），容器里的 Chromium 需要足够的 /dev/shm
    #[serde(default = "default_container_shm_size")]
    pub container_shm_size: u64,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// 追加给容器内浏览器入口命令的启动参数。
    /// 会话只是附着到已运行的浏览器，所以启动参数必须在容器这一层给
    #[serde(default)]
    pub option_args: Vec<String>,
    #[serde(default = "default_remove_on_cleanup")]
    pub remove_on_cleanup: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_host_network")]
    pub host_network: String,
    /// 是否让会话走代理
    #[serde(default = "default_session_proxy")]
    pub proxy: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new("config.toml"));
        let cfg = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
            toml::from_str::<AppConfig>(&raw)
                .with_context(|| format!("解析配置文件失败: {}", path.display()))?
        } else {
            AppConfig::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// 加载时就把配置问题暴露出来，而不是等到运行中途才失败
    fn validate(&self) -> Result<()> {
        if self.targets.len() > self.docker.ports.len() {
            bail!(
                "配置的端口数量不足: {} 个目标只有 {} 个端口",
                self.targets.len(),
                self.docker.ports.len()
            );
        }
        for target in &self.targets {
            if target.name.trim().is_empty() {
                bail!("目标名称不能为空");
            }
        }
        if self.proxy.usage_limit == 0 {
            bail!("代理使用上限必须大于 0");
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            proxy: ProxyConfig::default(),
            docker: DockerConfig::default(),
            session: SessionConfig::default(),
            request_delay_ms: default_request_delay_ms(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            input_file: default_proxy_input_file(),
            test_url: default_proxy_test_url(),
            usage_limit: default_proxy_usage_limit(),
            validation: default_proxy_validation(),
            scheme: ProxyScheme::default(),
            username: None,
            password: None,
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            container_image: default_container_image(),
            automation_port: default_automation_port(),
            container_shm_size: default_container_shm_size(),
            network_mode: default_network_mode(),
            environment: HashMap::new(),
            option_args: Vec::new(),
            remove_on_cleanup: default_remove_on_cleanup(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_network: default_host_network(),
            proxy: default_session_proxy(),
            retry_attempts: default_retry_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            user_agent: None,
        }
    }
}

fn default_request_delay_ms() -> u64 {
    1000
}

fn default_proxy_input_file() -> PathBuf {
    PathBuf::from("proxies.txt")
}

fn default_proxy_test_url() -> String {
    "https://httpbin.org/ip".to_string()
}

fn default_proxy_usage_limit() -> u32 {
    10
}

fn default_proxy_validation() -> bool {
    true
}

fn default_container_image() -> String {
    "chromedp/headless-shell:latest".to_string()
}

fn default_automation_port() -> u16 {
    9222
}

fn default_container_shm_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

fn default_remove_on_cleanup() -> bool {
    true
}

fn default_host_network() -> String {
    "http://127.0.0.1".to_string()
}

fn default_session_proxy() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    500
}
