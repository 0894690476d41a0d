mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::FakeDevice;
use futures::StreamExt;
use mobiledevice::{
    AttachedDevice, Device, DeviceError, DeviceEvent, DeviceListener, DeviceRegistry,
    DeviceWatcher,
    connector::ConnectorFuture,
    registry::DeviceEventStream,
};
use tokio::sync::mpsc;

type EventSender = mpsc::UnboundedSender<Result<DeviceEvent, DeviceError>>;

/// Feeds the registry whatever the test pushes into the channel
#[derive(Debug)]
struct ChannelWatcher {
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<DeviceEvent, DeviceError>>>>,
}

impl ChannelWatcher {
    fn new() -> (Arc<Self>, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(Self {
            events: Mutex::new(Some(rx)),
        });
        (watcher, tx)
    }
}

impl DeviceWatcher for ChannelWatcher {
    fn subscribe(&self) -> ConnectorFuture<'_, DeviceEventStream> {
        Box::pin(async move {
            let rx = self
                .events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| DeviceError::SubscriptionError("already subscribed".into()))?;
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            Ok(Box::pin(stream) as DeviceEventStream)
        })
    }
}

#[derive(Debug)]
struct UnreachableWatcher;

impl DeviceWatcher for UnreachableWatcher {
    fn subscribe(&self) -> ConnectorFuture<'_, DeviceEventStream> {
        Box::pin(async {
            Err(DeviceError::ConnectionFailed(Arc::new(
                std::io::ErrorKind::NotFound.into(),
            )))
        })
    }
}

struct EventLog {
    tx: mpsc::UnboundedSender<String>,
}

impl EventLog {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl DeviceListener for EventLog {
    fn device_connected(&self, device: &Device) {
        let _ = self.tx.send(format!("+{}", device.udid()));
    }

    fn device_disconnected(&self, device: &Device) {
        let _ = self.tx.send(format!("-{}", device.udid()));
    }
}

fn attach(tx: &EventSender, udid: &str, device_id: u32) {
    tx.send(Ok(DeviceEvent::Attached(AttachedDevice {
        udid: udid.to_string(),
        device_id,
        connector: Arc::new(FakeDevice::new(true)),
    })))
    .unwrap();
}

fn udids(registry: &DeviceRegistry) -> Vec<String> {
    registry
        .devices()
        .iter()
        .map(|d| d.udid().to_string())
        .collect()
}

#[tokio::test]
async fn attach_and_detach_reach_the_listener() {
    let (watcher, tx) = ChannelWatcher::new();
    let registry = DeviceRegistry::new(watcher);
    let (log, mut events) = EventLog::new();
    registry.set_listener(Some(log)).await.unwrap();

    attach(&tx, "first", 1);
    attach(&tx, "second", 2);
    assert_eq!(events.recv().await.unwrap(), "+first");
    assert_eq!(events.recv().await.unwrap(), "+second");
    assert_eq!(udids(&registry), ["first", "second"]);

    let first = registry.device_with_udid("first").unwrap();
    tx.send(Ok(DeviceEvent::Detached(1))).unwrap();
    assert_eq!(events.recv().await.unwrap(), "-first");

    // events are handled in order, so the detach is complete once this arrives
    attach(&tx, "third", 3);
    assert_eq!(events.recv().await.unwrap(), "+third");
    assert_eq!(udids(&registry), ["second", "third"]);

    assert!(matches!(
        registry.device_with_udid("first"),
        Err(DeviceError::DeviceNotFound)
    ));
    assert!(first.is_detached());
    assert!(matches!(
        first.value_for_key("DeviceName", None).await,
        Err(DeviceError::DeviceNotFound)
    ));
}

#[tokio::test]
async fn events_without_a_listener_are_not_replayed() {
    let (watcher, tx) = ChannelWatcher::new();
    let registry = DeviceRegistry::new(watcher);
    registry.start().await.unwrap();

    attach(&tx, "early", 1);
    let early = registry.wait_for_connection().await.unwrap();
    assert_eq!(early.udid(), "early");

    let (log, mut events) = EventLog::new();
    registry.set_listener(Some(log)).await.unwrap();
    attach(&tx, "late", 2);
    assert_eq!(events.recv().await.unwrap(), "+late");
    assert_eq!(udids(&registry), ["early", "late"]);
}

#[tokio::test]
async fn a_new_listener_replaces_the_old_one() {
    let (watcher, tx) = ChannelWatcher::new();
    let registry = DeviceRegistry::new(watcher);

    let (old, mut old_events) = EventLog::new();
    registry.set_listener(Some(old)).await.unwrap();
    attach(&tx, "one", 1);
    assert_eq!(old_events.recv().await.unwrap(), "+one");

    let (new, mut new_events) = EventLog::new();
    registry.set_listener(Some(new)).await.unwrap();
    attach(&tx, "two", 2);
    assert_eq!(new_events.recv().await.unwrap(), "+two");
    assert!(old_events.try_recv().is_err());
}

#[tokio::test]
async fn subscription_failures_are_reported() {
    let registry = DeviceRegistry::new(Arc::new(UnreachableWatcher));
    let (log, _events) = EventLog::new();

    assert!(matches!(
        registry.set_listener(Some(log)).await,
        Err(DeviceError::SubscriptionError(_))
    ));
    assert!(matches!(
        registry.last_error(),
        Some(DeviceError::SubscriptionError(_))
    ));
    assert!(!registry.is_watching());
    assert!(registry.devices().is_empty());
}

#[tokio::test]
async fn explicit_detach_forgets_the_device() {
    let (watcher, tx) = ChannelWatcher::new();
    let registry = DeviceRegistry::new(watcher);
    registry.start().await.unwrap();
    attach(&tx, "phone", 5);

    let device = registry.wait_for_connection().await.unwrap();
    device.value_for_key("DeviceName", None).await.unwrap();

    registry.detach_device(&device);
    assert!(registry.devices().is_empty());
    assert!(matches!(
        registry.device_with_udid("phone"),
        Err(DeviceError::DeviceNotFound)
    ));
    assert!(matches!(
        device.connect().await,
        Err(DeviceError::DeviceNotFound)
    ));
}

#[tokio::test]
async fn waiting_ends_when_events_stop() {
    let (watcher, tx) = ChannelWatcher::new();
    let registry = DeviceRegistry::new(watcher);
    registry.start().await.unwrap();

    tx.send(Err(DeviceError::ConnectionFailed(Arc::new(
        std::io::ErrorKind::BrokenPipe.into(),
    ))))
    .unwrap();
    // depending on timing the stream has already failed or the resubscription is refused
    assert!(registry.wait_for_connection().await.is_err());
    assert!(!registry.is_watching());
    assert!(registry.last_error().is_some());
}

struct PanickingListener;

impl DeviceListener for PanickingListener {
    fn device_connected(&self, device: &Device) {
        panic!("listener rejected {}", device.udid());
    }
}

#[tokio::test]
async fn a_panicking_listener_stops_the_watch() {
    let (watcher, tx) = ChannelWatcher::new();
    let registry = DeviceRegistry::new(watcher);
    registry
        .set_listener(Some(Arc::new(PanickingListener)))
        .await
        .unwrap();
    assert!(registry.is_watching());

    attach(&tx, "boom", 1);
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.is_watching() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("event task never reported that it stopped");

    // the event arrived before the listener failed, so the device is still known
    assert_eq!(udids(&registry), ["boom"]);
}

#[tokio::test]
async fn duplicate_attach_events_are_ignored() {
    let (watcher, tx) = ChannelWatcher::new();
    let registry = DeviceRegistry::new(watcher);
    let (log, mut events) = EventLog::new();
    registry.set_listener(Some(log)).await.unwrap();

    attach(&tx, "same", 9);
    attach(&tx, "same", 9);
    attach(&tx, "other", 10);
    assert_eq!(events.recv().await.unwrap(), "+same");
    assert_eq!(events.recv().await.unwrap(), "+other");
    assert_eq!(udids(&registry), ["same", "other"]);
}

#[test]
fn client_version_names_the_crate() {
    assert!(DeviceRegistry::client_version().starts_with("mobiledevice-"));
}

#[tokio::test]
async fn channel_watcher_subscribes_once() {
    let (watcher, tx) = ChannelWatcher::new();
    attach(&tx, "direct", 1);
    drop(tx);

    let events: Vec<_> = watcher.subscribe().await.unwrap().collect().await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        Ok(DeviceEvent::Attached(d)) if d.udid == "direct"
    ));
    assert!(watcher.subscribe().await.is_err());
}
