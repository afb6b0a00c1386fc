//! Single active instance manager
//!
//! Owns the one externally visible instance. The slot is only assigned after
//! a successful start; an instance displaced by a newer start is closed after
//! the swap, so concurrent starts end with exactly one occupant (last writer
//! wins) and nothing leaks.
//!
//! When the new configuration listens on an address the active instance
//! holds, the active instance is closed before binding. If that start then
//! fails, the slot is left empty.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::app::{Instance, InstanceState};
use crate::config::compile;
use crate::error::{Error, Result};

use super::log::LogSink;

/// Library API revision reported by [`CoreManager::version`]
pub const LIB_VERSION: u32 = 1;

/// Engine version reported by [`CoreManager::version`]
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Mutex-guarded handle to the active instance slot
#[derive(Default)]
pub struct CoreManager {
    slot: Mutex<Option<Arc<Instance>>>,
}

impl CoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile, build and start `raw`, then make it the active instance.
    ///
    /// Failures are reported to `sink` and returned. The slot is untouched
    /// unless the active instance was already handed its listen addresses
    /// back, in which case it stays empty.
    pub async fn start(&self, raw: &[u8], sink: &dyn LogSink) -> Result<()> {
        let config = compile(raw).map_err(|e| {
            sink.log_input(&format!("Config load error: {}", e));
            e
        })?;

        let instance = Instance::build(&config).map_err(|e| {
            sink.log_input(&format!("Create core error: {}", e));
            e
        })?;

        let holder = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(active) if instance.shares_listen_addr(active) => slot.take(),
                _ => None,
            }
        };
        if let Some(holder) = holder {
            info!("Active instance holds a listen address of the new one, closing it first");
            if let Err(e) = holder.close().await {
                warn!("Failed to close replaced instance: {}", e);
            }
        }

        if let Err(e) = instance.start().await {
            sink.log_input(&format!("Start core error: {}", e));
            if let Err(cleanup) = instance.close().await {
                warn!("Failed to clean up instance after start error: {}", cleanup);
            }
            return Err(e);
        }

        let previous = self.slot.lock().replace(Arc::new(instance));
        if let Some(previous) = previous {
            info!("Replacing active instance");
            if let Err(e) = previous.close().await {
                warn!("Failed to close replaced instance: {}", e);
            }
        }

        Ok(())
    }

    /// Close the active instance and empty the slot
    pub async fn stop(&self) -> Result<()> {
        let instance = self.slot.lock().take().ok_or(Error::NoActiveInstance)?;
        instance.close().await
    }

    pub fn is_running(&self) -> bool {
        self.state() == Some(InstanceState::Running)
    }

    /// State of the active instance, if any
    pub fn state(&self) -> Option<InstanceState> {
        self.slot.lock().as_ref().map(|i| i.state())
    }

    /// Shared handle to the active instance, if any
    pub fn active(&self) -> Option<Arc<Instance>> {
        self.slot.lock().clone()
    }

    /// Library marker plus engine version
    pub fn version() -> String {
        format!("Lib v{}, Netium-core v{}", LIB_VERSION, CORE_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::TracingSink;

    const DIRECT: &[u8] = br#"{"outbounds": [{"tag": "direct", "protocol": "freedom"}]}"#;

    fn collecting_sink() -> (Arc<Mutex<Vec<String>>>, impl LogSink) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        (lines, move |m: &str| captured.lock().push(m.to_string()))
    }

    #[tokio::test]
    async fn test_start_stop_stop() {
        let manager = CoreManager::new();
        let (lines, sink) = collecting_sink();

        manager.start(DIRECT, &sink).await.unwrap();
        assert!(manager.is_running());
        let active = manager.active().unwrap();

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        assert_eq!(active.state(), InstanceState::Closed);

        assert!(matches!(manager.stop().await, Err(Error::NoActiveInstance)));
        assert!(lines.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let manager = CoreManager::new();
        assert!(matches!(manager.stop().await, Err(Error::NoActiveInstance)));
        assert_eq!(manager.state(), None);
    }

    #[tokio::test]
    async fn test_failures_logged_and_slot_untouched() {
        let manager = CoreManager::new();
        let (lines, sink) = collecting_sink();

        let result = manager.start(b"{not json", &sink).await;
        assert!(matches!(result, Err(Error::Decode(_))));

        let result = manager
            .start(
                br#"{"outbounds": [{"tag": "direct", "protocol": "freedom"}],
                     "routing": {"rules": [{"type": "field", "port": 80, "outboundTag": "nope"}]}}"#,
                &sink,
            )
            .await;
        assert!(matches!(result, Err(Error::Build(_))));

        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let raw = format!(
            r#"{{"inbounds": [{{"listen": "127.0.0.1", "port": {}, "protocol": "socks"}}],
                "outbounds": [{{"protocol": "freedom"}}]}}"#,
            taken.local_addr().unwrap().port()
        );
        let result = manager.start(raw.as_bytes(), &sink).await;
        assert!(matches!(result, Err(Error::Start(_))));

        assert!(manager.active().is_none());
        let lines = lines.lock();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Config load error: "));
        assert!(lines[1].starts_with("Config load error: "));
        assert!(lines[2].starts_with("Start core error: "));
    }

    #[tokio::test]
    async fn test_failed_start_keeps_previous() {
        let manager = CoreManager::new();
        manager.start(DIRECT, &TracingSink).await.unwrap();
        let first = manager.active().unwrap();

        assert!(manager.start(b"", &TracingSink).await.is_err());
        assert!(Arc::ptr_eq(&first, &manager.active().unwrap()));
        assert!(first.is_running());

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_replacement_closes_previous() {
        let manager = CoreManager::new();
        manager.start(DIRECT, &TracingSink).await.unwrap();
        let first = manager.active().unwrap();

        manager.start(DIRECT, &TracingSink).await.unwrap();
        assert_eq!(first.state(), InstanceState::Closed);
        assert!(manager.is_running());

        manager.stop().await.unwrap();
    }

    fn fixed_port_config(port: u16, outbound: &str) -> Vec<u8> {
        format!(
            r#"{{
                "inbounds": [{{"tag": "in", "listen": "127.0.0.1", "port": {}, "protocol": "socks"}}],
                "outbounds": [{{"tag": "{}", "protocol": "freedom"}}]
            }}"#,
            port, outbound
        )
        .into_bytes()
    }

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_restart_on_same_fixed_port() {
        let port = free_port().await;
        let manager = CoreManager::new();
        let (lines, sink) = collecting_sink();

        manager.start(&fixed_port_config(port, "a"), &sink).await.unwrap();
        let first = manager.active().unwrap();

        manager.start(&fixed_port_config(port, "b"), &sink).await.unwrap();
        let second = manager.active().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), InstanceState::Closed);
        assert!(second.is_running());
        assert_eq!(second.inbound_addrs()[0].1.port(), port);
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());
        assert!(lines.lock().is_empty());

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_port_conflict_keeps_previous() {
        let manager = CoreManager::new();
        manager.start(DIRECT, &TracingSink).await.unwrap();
        let first = manager.active().unwrap();

        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        assert!(manager.start(&fixed_port_config(port, "b"), &TracingSink).await.is_err());
        assert!(Arc::ptr_eq(&first, &manager.active().unwrap()));
        assert!(first.is_running());

        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_leave_one() {
        let manager = Arc::new(CoreManager::new());
        let a: &'static [u8] = br#"{"outbounds": [{"tag": "a", "protocol": "freedom"}]}"#;
        let b: &'static [u8] = br#"{"outbounds": [{"tag": "b", "protocol": "blackhole"}]}"#;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                let raw = if i % 2 == 0 { a } else { b };
                tokio::spawn(async move { manager.start(raw, &TracingSink).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(manager.is_running());
        manager.stop().await.unwrap();
        assert!(matches!(manager.stop().await, Err(Error::NoActiveInstance)));
    }

    #[test]
    fn test_version() {
        let version = CoreManager::version();
        assert!(version.starts_with("Lib v1, "));
        assert!(version.contains("Netium-core v"));
        assert!(!CORE_VERSION.is_empty());
    }
}
