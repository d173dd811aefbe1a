//! Parent adapter against an in-process worker service over a duplex pipe.

use paperflow_protocol::{Driver, ScanDevice, ScanOptions};
use paperflow_worker::{
    serve_connection, CancellationToken, ChannelTimeouts, DriverError, DriverRegistry,
    ScanUpdate, WorkerError, WorkerServiceAdapter,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn connect_in_process() -> (WorkerServiceAdapter, JoinHandle<Result<(), WorkerError>>) {
    let (parent, worker) = tokio::io::duplex(1 << 20);
    let service = tokio::spawn(async move {
        serve_connection(worker, &DriverRegistry::with_builtin()).await
    });
    let adapter = WorkerServiceAdapter::new(0, Box::new(parent), ChannelTimeouts::default());
    (adapter, service)
}

#[tokio::test]
async fn init_validates_the_storage_folder() {
    let (mut adapter, service) = connect_in_process();
    let dir = tempfile::tempdir().unwrap();

    adapter.init(Some(dir.path())).await.unwrap();
    adapter.init(None).await.unwrap();

    let err = adapter
        .init(Some(dir.path().join("missing").as_path()))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Driver(DriverError::Fault(_))));

    drop(adapter);
    service.await.unwrap().unwrap();
}

#[tokio::test]
async fn device_list_streams_every_device() {
    let (mut adapter, _service) = connect_in_process();
    let (tx, mut rx) = mpsc::channel(8);
    adapter
        .get_device_list(
            &ScanOptions::for_driver(Driver::Sim),
            &CancellationToken::new(),
            &tx,
        )
        .await
        .unwrap();
    drop(tx);

    let mut ids = Vec::new();
    while let Some(device) = rx.recv().await {
        ids.push(device.id);
    }
    assert_eq!(ids, vec!["sim:flatbed", "sim:feeder"]);
}

#[tokio::test]
async fn unsupported_driver_is_reported_as_a_fault() {
    let (mut adapter, _service) = connect_in_process();
    let (tx, _rx) = mpsc::channel(8);
    let err = adapter
        .scan(
            &ScanOptions::for_driver(Driver::Escl),
            &CancellationToken::new(),
            &tx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Driver(DriverError::Unsupported(_))));
}

#[tokio::test]
async fn requests_can_follow_each_other_on_one_channel() {
    let (mut adapter, _service) = connect_in_process();
    let options = ScanOptions::default().with_device(ScanDevice::new(
        Driver::Sim,
        "sim:flatbed?pages=1",
        "Flatbed",
    ));

    for _ in 0..2 {
        let (tx, mut rx) = mpsc::channel(8);
        let collector = tokio::spawn(async move {
            let mut pages = 0;
            while let Some(update) = rx.recv().await {
                if let ScanUpdate::Page(image) = update {
                    image.validate().unwrap();
                    pages += 1;
                }
            }
            pages
        });
        adapter
            .scan(&options, &CancellationToken::new(), &tx)
            .await
            .unwrap();
        drop(tx);
        assert_eq!(collector.await.unwrap(), 1);
    }
}
