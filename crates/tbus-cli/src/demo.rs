//! Demo echo device exposed by `tbus expose`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tbus_core::signal;
use tbus_core::{DeviceBase, DispatchTable, ServiceDevice};
use tbus_types::{DeviceInfo, RemoteError};
use tokio::sync::watch;
use tracing::debug;

pub const ECHO_CLASS_ID: u32 = 0x0100;
/// `String -> String`
pub const ECHO_METHOD: u8 = 1;
/// `() -> u64`, the number of echo calls served so far.
pub const CALL_COUNT_METHOD: u8 = 2;
/// `u64` counter, one event per heartbeat period.
pub const HEARTBEAT_CHANNEL: u8 = 1;

pub fn echo_device() -> Arc<ServiceDevice> {
    let calls = Arc::new(AtomicU64::new(0));
    let counted = calls.clone();
    let table = DispatchTable::new()
        .method(ECHO_METHOD, move |text: String| {
            counted.fetch_add(1, Ordering::Relaxed);
            async move { Ok::<_, RemoteError>(text) }
        })
        .method(CALL_COUNT_METHOD, move |_: ()| {
            let n = calls.load(Ordering::Relaxed);
            async move { Ok::<_, RemoteError>(n) }
        });
    Arc::new(ServiceDevice::new(
        DeviceInfo::new(ECHO_CLASS_ID).with_label("role", "echo"),
        table,
    ))
}

/// Emit a counter on [`HEARTBEAT_CHANNEL`] every `period` until `shutdown`
/// fires. Beats while the device is detached are skipped.
pub async fn heartbeat(device: Arc<DeviceBase>, period: Duration, shutdown: watch::Receiver<bool>) {
    let stop = signal::aborted(Some(shutdown));
    tokio::pin!(stop);
    let mut ticker = tokio::time::interval(period);
    let mut beat: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => return,
            _ = ticker.tick() => {}
        }
        if !device.is_attached() {
            continue;
        }
        beat += 1;
        if let Err(e) = device.emit_event(HEARTBEAT_CHANNEL, &beat).await {
            debug!(beat, error = %e, "heartbeat not sent");
        }
    }
}
