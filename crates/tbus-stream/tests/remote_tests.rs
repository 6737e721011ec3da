//! End-to-end tests over loopback TCP: a host bus with a remote bus plugged
//! in through [`RemoteDeviceHost`] and [`RemoteBusPort`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tbus_core::signal::abort_signal;
use tbus_core::{Bus, BusCtl, Controller, Device, DispatchTable, LocalBus, Master, ServiceDevice};
use tbus_stream::{HostEvent, RemoteBusPort, RemoteDeviceHost};
use tbus_types::{BUS_CLASS_ID, DeviceInfo, RemoteError, TbusError};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const ECHO_CLASS: u32 = 0x0100;
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    value: i32,
}

fn echo_device() -> Arc<ServiceDevice> {
    let table = DispatchTable::new()
        .method(2, |reading: Reading| async move { Ok::<_, RemoteError>(reading) })
        .method(3, |_: ()| async move {
            Err::<(), _>(RemoteError::application("sensor offline"))
        });
    Arc::new(ServiceDevice::new(
        DeviceInfo::new(ECHO_CLASS).with_device_id(9),
        table,
    ))
}

struct Fixture {
    root: Arc<LocalBus>,
    master: Master,
    echo: Arc<ServiceDevice>,
    host_events: mpsc::UnboundedReceiver<HostEvent>,
    stop_device: watch::Sender<bool>,
    device_task: JoinHandle<Result<(), TbusError>>,
    _stop_host: watch::Sender<bool>,
}

/// Host a root bus, connect a remote bus holding the echo device at 1, and
/// wait until the host has plugged it.
async fn connected() -> Result<Fixture, Box<dyn std::error::Error>> {
    let root = LocalBus::new();
    let (tx, mut host_events) = mpsc::unbounded_channel();
    let host = RemoteDeviceHost::bind("127.0.0.1:0").await?.with_notify(tx);
    let addr = host.local_addr()?;
    let (stop_host, host_signal) = abort_signal();
    let bus: Arc<dyn Bus> = root.clone();
    tokio::spawn(async move { host.run(bus, host_signal).await });

    let remote = LocalBus::with_info(DeviceInfo::new(BUS_CLASS_ID).with_label("site", "lab"));
    let echo = echo_device();
    remote.plug(echo.clone()).await?;

    let (stop_device, device_signal) = abort_signal();
    let port = RemoteBusPort::new(remote);
    let device_task = tokio::spawn(async move { port.connect(addr, Some(device_signal)).await });

    match timeout(WAIT, host_events.recv()).await? {
        Some(HostEvent::Attached(info)) => assert_eq!(info.address, 1),
        other => panic!("expected attach, got {other:?}"),
    }
    let master = Master::new(root.clone()).await?;
    Ok(Fixture {
        root,
        master,
        echo,
        host_events,
        stop_device,
        device_task,
        _stop_host: stop_host,
    })
}

#[tokio::test]
async fn remote_bus_is_enumerated_with_its_identity() -> Result<(), Box<dyn std::error::Error>> {
    let fx = connected().await?;

    let root = BusCtl::new(fx.master.clone(), Vec::<u8>::new()).enumerate().await?;
    assert_eq!(root.devices.len(), 1);
    let remote = &root.devices[0];
    assert_eq!(remote.address, 1);
    assert_eq!(remote.class_id, BUS_CLASS_ID);
    assert_eq!(remote.label("site"), Some("lab"));

    let nested = BusCtl::new(fx.master.clone(), [1u8]).enumerate().await?;
    assert_eq!(nested.devices.len(), 1);
    assert_eq!(nested.devices[0].address, 1);
    assert_eq!(nested.devices[0].class_id, ECHO_CLASS);
    assert_eq!(nested.devices[0].device_id, 9);
    Ok(())
}

#[tokio::test]
async fn calls_cross_the_connection() -> Result<(), Box<dyn std::error::Error>> {
    let fx = connected().await?;
    let ctl = Controller::new(fx.master.clone(), [1u8, 1]);

    let reading = Reading {
        sensor: "temp".into(),
        value: -4,
    };
    let back: Reading = ctl.invoke(2, &reading).await?;
    assert_eq!(back, reading);

    let err = ctl.invoke::<_, ()>(3, &()).await.unwrap_err();
    assert!(matches!(err, TbusError::Remote(ref m) if m == "sensor offline"));

    let err = ctl.invoke::<_, ()>(7, &()).await.unwrap_err();
    assert!(matches!(err, TbusError::InvalidMethod));
    Ok(())
}

#[tokio::test]
async fn routing_errors_come_back_from_the_remote_side() -> Result<(), Box<dyn std::error::Error>> {
    let fx = connected().await?;

    let missing = BusCtl::new(fx.master.clone(), [1u8, 9]).enumerate().await.unwrap_err();
    assert!(matches!(missing, TbusError::InvalidAddress));

    let past_leaf = BusCtl::new(fx.master.clone(), [1u8, 1, 1]).enumerate().await.unwrap_err();
    assert!(matches!(past_leaf, TbusError::RouteNotSupported));
    Ok(())
}

#[tokio::test]
async fn remote_events_carry_the_full_address() -> Result<(), Box<dyn std::error::Error>> {
    let fx = connected().await?;
    let ctl = Controller::new(fx.master.clone(), [1u8, 1]);
    let mut readings = ctl.events::<Reading>(4);

    let reading = Reading {
        sensor: "hum".into(),
        value: 55,
    };
    fx.echo.handle().emit_event(4, &reading).await?;
    assert_eq!(timeout(WAIT, readings.recv()).await?, Some(reading));

    // A subscription on another device's address sees nothing.
    let mut elsewhere = Controller::new(fx.master.clone(), [1u8, 2]).events::<Reading>(4);
    fx.echo.handle().emit_event(4, &Reading { sensor: "x".into(), value: 0 }).await?;
    assert!(timeout(Duration::from_millis(100), elsewhere.recv()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn disconnect_unplugs_the_remote_device() -> Result<(), Box<dyn std::error::Error>> {
    let mut fx = connected().await?;
    assert_eq!(fx.root.len(), 1);

    fx.stop_device.send(true)?;
    timeout(WAIT, fx.device_task).await???;

    match timeout(WAIT, fx.host_events.recv()).await? {
        Some(HostEvent::Detached(info)) => assert_eq!(info.class_id, BUS_CLASS_ID),
        other => panic!("expected detach, got {other:?}"),
    }
    assert!(fx.root.is_empty());
    let root = BusCtl::new(fx.master.clone(), Vec::<u8>::new()).enumerate().await?;
    assert!(root.devices.is_empty());
    Ok(())
}

#[tokio::test]
async fn bad_handshake_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let host = RemoteDeviceHost::bind("127.0.0.1:0").await?;
    let addr = host.local_addr()?;

    let mut bad = TcpStream::connect(addr).await?;
    bad.write_all(&[0x42, 0x00, 0x00]).await?;
    bad.shutdown().await?;

    let good = tokio::spawn(async move {
        let port = RemoteBusPort::new(echo_device());
        port.connect(addr, None).await
    });

    let device = timeout(WAIT, host.accept()).await??;
    assert_eq!(device.info().class_id, ECHO_CLASS);
    assert_eq!(device.info().device_id, 9);

    // Serving it plugs the device, which answers the connecting side's
    // handshake.
    let root = LocalBus::new();
    let master = Master::new(root.clone()).await?;
    let (stop, signal) = abort_signal();
    let serve = tokio::spawn(Arc::new(device).serve(root.clone(), Some(signal)));
    timeout(WAIT, async {
        while root.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    let reading = Reading {
        sensor: "p".into(),
        value: 1,
    };
    let back: Reading = Controller::new(master, [1u8]).invoke(2, &reading).await?;
    assert_eq!(back, reading);

    stop.send(true)?;
    timeout(WAIT, serve).await???;
    timeout(WAIT, good).await???;
    assert!(root.is_empty());
    Ok(())
}
