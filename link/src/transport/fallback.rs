//! Transport that tries several transports in order.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::encoder::WireData;
use crate::error::{CableError, Result};
use crate::events::EventBus;
use crate::sync::lock;

use super::{Transport, TransportEvent};

/// Opens the first transport of the list that manages to connect.
///
/// Only the active transport's events are forwarded; when it closes, the
/// next `open()` starts again from the top of the list.
pub struct FallbackTransport {
    transports: Vec<Arc<dyn Transport>>,
    active: Arc<Mutex<Option<usize>>>,
    events: EventBus<TransportEvent>,
}

impl FallbackTransport {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        let active: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));
        let events = EventBus::new();

        for (index, transport) in transports.iter().enumerate() {
            let active = active.clone();
            let events = events.clone();
            // Fallback emits its own Open once the winner is chosen.
            transport.events().on_any(move |event: &TransportEvent| {
                if matches!(event, TransportEvent::Open) {
                    return;
                }
                let is_active = {
                    let mut current = lock(&active);
                    let is_active = *current == Some(index);
                    if is_active && matches!(event, TransportEvent::Close(_)) {
                        *current = None;
                    }
                    is_active
                };
                if is_active {
                    events.emit(event);
                }
            });
        }

        Self {
            transports,
            active,
            events,
        }
    }

    fn active_transport(&self) -> Option<Arc<dyn Transport>> {
        let index = (*lock(&self.active))?;
        self.transports.get(index).cloned()
    }
}

#[async_trait]
impl Transport for FallbackTransport {
    fn display_name(&self) -> String {
        match self.active_transport() {
            Some(transport) => format!("FallbackTransport({})", transport.display_name()),
            None => {
                let names: Vec<String> = self.transports.iter().map(|t| t.display_name()).collect();
                format!("FallbackTransport([{}])", names.join(", "))
            },
        }
    }

    async fn open(&self) -> Result<()> {
        if self.active_transport().is_some() {
            return Err(CableError::InvalidState("Transport is already open".to_string()));
        }

        let mut last_error =
            CableError::ConfigurationError("FallbackTransport has no transports".to_string());

        for (index, transport) in self.transports.iter().enumerate() {
            log::debug!("[cable-link] Trying transport {}", transport.display_name());
            match transport.open().await {
                Ok(()) => {
                    *lock(&self.active) = Some(index);
                    log::debug!("[cable-link] Connected via {}", transport.display_name());
                    self.events.emit(&TransportEvent::Open);
                    return Ok(());
                },
                Err(err) => {
                    log::debug!(
                        "[cable-link] Transport {} failed to open: {}",
                        transport.display_name(),
                        err
                    );
                    last_error = err;
                },
            }
        }

        Err(last_error)
    }

    fn send(&self, data: WireData) -> Result<()> {
        match self.active_transport() {
            Some(transport) => transport.send(data),
            None => Err(CableError::TransportError("No active transport".to_string())),
        }
    }

    fn close(&self) -> Result<()> {
        let active = lock(&self.active).take();
        match active.and_then(|index| self.transports.get(index)) {
            Some(transport) => transport.close(),
            None => Ok(()),
        }
    }

    fn set_url(&self, url: &str) -> Result<()> {
        for transport in &self.transports {
            transport.set_url(url)?;
        }
        Ok(())
    }

    fn set_param(&self, key: &str, value: &str) {
        for transport in &self.transports {
            transport.set_param(key, value);
        }
    }

    fn events(&self) -> &EventBus<TransportEvent> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubTransport {
        name: &'static str,
        fail: bool,
        sent: AtomicUsize,
        events: EventBus<TransportEvent>,
    }

    impl StubTransport {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                sent: AtomicUsize::new(0),
                events: EventBus::new(),
            })
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn display_name(&self) -> String {
            self.name.to_string()
        }

        async fn open(&self) -> Result<()> {
            if self.fail {
                return Err(CableError::TransportError(format!("{} unavailable", self.name)));
            }
            self.events.emit(&TransportEvent::Open);
            Ok(())
        }

        fn send(&self, _data: WireData) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }

        fn set_url(&self, _url: &str) -> Result<()> {
            Ok(())
        }

        fn set_param(&self, _key: &str, _value: &str) {}

        fn events(&self) -> &EventBus<TransportEvent> {
            &self.events
        }
    }

    #[tokio::test]
    async fn test_uses_first_transport_that_opens() {
        let ws = StubTransport::new("ws", true);
        let poll = StubTransport::new("longpoll", false);
        let fallback = FallbackTransport::new(vec![ws.clone() as Arc<dyn Transport>, poll.clone()]);

        let opens = Arc::new(AtomicUsize::new(0));
        let counter = opens.clone();
        fallback.events().on_any(move |event| {
            if matches!(event, TransportEvent::Open) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        fallback.open().await.unwrap();
        fallback.send(WireData::Text("{}".to_string())).unwrap();

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(ws.sent.load(Ordering::SeqCst), 0);
        assert_eq!(poll.sent.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.display_name(), "FallbackTransport(longpoll)");
    }

    #[tokio::test]
    async fn test_only_active_transport_events_are_forwarded() {
        let first = StubTransport::new("first", false);
        let second = StubTransport::new("second", false);
        let fallback = FallbackTransport::new(vec![first.clone() as Arc<dyn Transport>, second.clone()]);
        fallback.open().await.unwrap();

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        fallback.events().on_any(move |event| {
            if matches!(event, TransportEvent::Close(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        second.events().emit(&TransportEvent::Close(None));
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        first.events().emit(&TransportEvent::Close(None));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(fallback.send(WireData::Text("{}".to_string())).is_err());
    }

    #[tokio::test]
    async fn test_all_transports_failing_returns_last_error() {
        let fallback = FallbackTransport::new(vec![
            StubTransport::new("a", true) as Arc<dyn Transport>,
            StubTransport::new("b", true),
        ]);

        let err = fallback.open().await.unwrap_err();
        assert_eq!(err, CableError::TransportError("b unavailable".to_string()));
    }
}
