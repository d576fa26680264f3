#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cable_link::{
    Cable, CableError, CableOptions, CableTimeouts, EventBus, Result, Transport, TransportEvent,
    WireData,
};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

/// In-memory transport: records outbound frames and lets the test play the server.
#[derive(Default)]
pub struct MemoryTransport {
    events: EventBus<TransportEvent>,
    sent: Mutex<Vec<Value>>,
    open: AtomicBool,
    fail_open: AtomicBool,
    auto_confirm: AtomicBool,
    opens: AtomicUsize,
    welcome: Mutex<Option<Value>>,
    params: Mutex<Vec<(String, String)>>,
}

impl MemoryTransport {
    /// Answers every open with a plain welcome.
    pub fn new() -> Arc<Self> {
        let transport = Self::default();
        *transport.welcome.lock().unwrap() = Some(welcome());
        Arc::new(transport)
    }

    /// Never answers on its own.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_welcome(&self, welcome: Option<Value>) {
        *self.welcome.lock().unwrap() = welcome;
    }

    /// Confirm every subscribe command as soon as it is sent.
    pub fn set_auto_confirm(&self, enabled: bool) {
        self.auto_confirm.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Deliver a server frame.
    pub fn push(&self, msg: Value) {
        self.events.emit(&TransportEvent::Data(WireData::Text(msg.to_string())));
    }

    /// Deliver a raw text frame as is.
    pub fn push_raw(&self, frame: &str) {
        self.events.emit(&TransportEvent::Data(WireData::Text(frame.to_string())));
    }

    /// Simulate the network dropping the connection.
    pub fn drop_connection(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.events.emit(&TransportEvent::Close(None));
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Frames whose `command` equals `command`.
    pub fn commands(&self, command: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|msg| msg["command"] == command)
            .collect()
    }

    pub fn param(&self, key: &str) -> Option<String> {
        self.params
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn display_name(&self) -> String {
        "memory".to_string()
    }

    async fn open(&self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CableError::TransportError("connection refused".into()));
        }
        self.open.store(true, Ordering::SeqCst);
        self.events.emit(&TransportEvent::Open);

        let welcome = self.welcome.lock().unwrap().clone();
        if let Some(welcome) = welcome {
            self.push(welcome);
        }
        Ok(())
    }

    fn send(&self, data: WireData) -> Result<()> {
        if !self.is_open() {
            return Err(CableError::NoConnection);
        }
        let msg: Value = match &data {
            WireData::Text(text) => serde_json::from_str(text)?,
            WireData::Binary(bytes) => serde_json::from_slice(bytes)?,
        };
        self.sent.lock().unwrap().push(msg.clone());

        if self.auto_confirm.load(Ordering::SeqCst) && msg["command"] == "subscribe" {
            self.push(confirm(msg["identifier"].as_str().unwrap_or_default()));
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_url(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    fn set_param(&self, key: &str, value: &str) {
        self.params
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
    }

    fn events(&self) -> &EventBus<TransportEvent> {
        &self.events
    }
}

pub fn test_timeouts() -> CableTimeouts {
    CableTimeouts::builder()
        .connection_timeout_secs(2)
        .subscribe_timeout_secs(2)
        .subscribe_cooldown_ms(0)
        .presence_timeout_secs(2)
        .build()
}

/// Options without a monitor so reconnects happen only when a test asks.
pub fn manual_options() -> CableOptions {
    CableOptions::default().with_monitor(None)
}

pub fn build_cable(transport: &Arc<MemoryTransport>, options: CableOptions) -> Cable {
    Cable::builder()
        .transport(transport.clone())
        .options(options)
        .timeouts(test_timeouts())
        .build()
        .expect("failed to build cable")
}

pub fn welcome() -> Value {
    json!({"type": "welcome"})
}

pub fn confirm(identifier: &str) -> Value {
    json!({"type": "confirm_subscription", "identifier": identifier})
}

pub fn reject(identifier: &str) -> Value {
    json!({"type": "reject_subscription", "identifier": identifier})
}

pub fn broadcast(identifier: &str, message: Value) -> Value {
    json!({"identifier": identifier, "message": message})
}

/// Poll `condition` until it holds; panics after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Wait until `n` frames with `command` were sent.
pub async fn wait_for_commands(transport: &MemoryTransport, command: &str, n: usize) -> Vec<Value> {
    wait_until(|| transport.commands(command).len() >= n).await;
    transport.commands(command)
}
