use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use scrape_farm::app::{self, AppConfig};
use scrape_farm::services::setup_orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    app::logging::init();

    // 可选的第一个参数是配置文件路径，默认 config.toml
    let config_path = env::args().nth(1).map(PathBuf::from);
    let cfg = AppConfig::load(config_path.as_deref())?;

    if cfg.targets.is_empty() {
        warn!("没有配置任何抓取目标，退出");
        return Ok(());
    }

    info!("🚀 开始初始化，共 {} 个目标", cfg.targets.len());
    let mut orchestrator = setup_orchestrator(&cfg).await?;

    let report = orchestrator.connect().await;
    info!(
        "📊 连接完成: {} 个就绪, {} 个失败",
        report.connected(),
        report.failed()
    );
    if report.connected() == 0 {
        error!("❌ 没有任何目标连接成功");
        orchestrator.disconnect().await;
        anyhow::bail!("所有目标连接失败");
    }

    let delay = Duration::from_millis(cfg.request_delay_ms);
    for target in &cfg.targets {
        for url in &target.urls {
            match orchestrator.make_request(&target.name, url).await {
                Ok(()) => info!("✅ '{}' 访问 {}", target.name, url),
                Err(e) => {
                    // 目标没连上，它剩下的链接也不用再试了
                    warn!("跳过目标 '{}' 的剩余链接: {}", target.name, e);
                    break;
                }
            }
            tokio::time::sleep(delay).await;
        }
    }

    orchestrator.disconnect().await;
    info!("🎉 全部完成");
    Ok(())
}
