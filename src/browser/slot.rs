use super::container::ContainerHandle;
use super::session::BrowserSession;

/// 一个抓取目标的连接槽：端口在启动时分配好，
/// 代理、容器、会话在 connect 阶段按顺序填充，只由编排器改写
#[derive(Debug)]
pub struct ConnectionSlot {
    name: String,
    port: u16,
    /// 裸 host:port 代理标识，不是池条目的所有权
    pub proxy: Option<String>,
    pub container: Option<ContainerHandle>,
    pub session: Option<BrowserSession>,
}

impl ConnectionSlot {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            proxy: None,
            container: None,
            session: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 有活跃会话才算就绪
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_slot_is_empty() {
        let slot = ConnectionSlot::new("books", 9051);
        assert_eq!(slot.name(), "books");
        assert_eq!(slot.port(), 9051);
        assert!(slot.proxy.is_none());
        assert!(slot.container.is_none());
        assert!(!slot.is_connected());
    }
}
