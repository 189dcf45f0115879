use std::fmt;

/// connect() 里失败发生在哪一步
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    Proxy,
    Container,
    Session,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Proxy => "获取代理",
            Self::Container => "启动容器",
            Self::Session => "创建会话",
        };
        f.write_str(label)
    }
}

/// 单个目标的连接结果
#[derive(Debug)]
pub enum SlotOutcome {
    Connected,
    Failed { stage: ProvisionStage, reason: String },
}

/// connect() 的逐目标结果汇总：一个目标失败不影响其他目标
#[derive(Debug, Default)]
pub struct ProvisioningReport {
    pub outcomes: Vec<(String, SlotOutcome)>,
}

impl ProvisioningReport {
    pub fn record(&mut self, target: impl Into<String>, outcome: SlotOutcome) {
        self.outcomes.push((target.into(), outcome));
    }

    pub fn connected(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, SlotOutcome::Connected))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.connected()
    }

    pub fn is_degraded(&self) -> bool {
        self.failed() > 0
    }
}
