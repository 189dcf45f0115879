pub mod container;
pub mod proxy;
pub mod session;
pub mod slot;

pub use container::{ContainerHandle, ContainerSupervisor};
pub use proxy::{ProxyPool, ProxyScheme};
pub use session::{BrowserSession, SessionSupervisor};
pub use slot::ConnectionSlot;
