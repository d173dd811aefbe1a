//! Parent side of the worker channel.
//!
//! [`WorkerServiceAdapter`] issues one request at a time and turns the
//! worker's reply stream back into callbacks, mirroring the in-process
//! driver API. Replies that carry a different request id belong to an
//! abandoned earlier request and are skipped.

use paperflow_protocol::{
    write_message, ErrorPayload, InitRequest, Message, OpCode, PagePayload, ProgressPayload,
    ProtocolError, ScanDevice, ScanOptions,
};
use std::path::Path;
use std::time::Duration;
use tokio::io::WriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::driver::ScanUpdate;
use crate::error::{DriverError, WorkerError};
use crate::transport::{spawn_message_reader, BoxedStream, Incoming};

/// Default time a worker gets to stop after a cancel request.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Deadlines applied to requests on a worker channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelTimeouts {
    /// After sending Cancel, the worker must finish within this window.
    pub cancel_grace: Duration,
    /// Longest silence tolerated while a request is running. `None` waits
    /// indefinitely; devices may legitimately pause for a long time.
    pub rpc_timeout: Option<Duration>,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            cancel_grace: DEFAULT_CANCEL_GRACE,
            rpc_timeout: None,
        }
    }
}

/// State of the request currently in flight.
struct Pending {
    id: u64,
    /// Stop requested because the consumer went away.
    stop: bool,
    cancel_deadline: Option<Instant>,
}

pub struct WorkerServiceAdapter {
    pid: u32,
    writer: WriteHalf<BoxedStream>,
    incoming: Incoming,
    reader: JoinHandle<()>,
    next_request_id: u64,
    timeouts: ChannelTimeouts,
    /// Set once a deadline expired; the worker must not be reused.
    aborted: Option<String>,
}

impl WorkerServiceAdapter {
    pub fn new(pid: u32, stream: BoxedStream, timeouts: ChannelTimeouts) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (incoming, reader) = spawn_message_reader(reader);
        Self {
            pid,
            writer,
            incoming,
            reader,
            next_request_id: 1,
            timeouts,
            aborted: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether a deadline expired on this channel.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    /// Tell the worker where the parent keeps backing files.
    pub async fn init(&mut self, storage_folder: Option<&Path>) -> Result<(), WorkerError> {
        let request = InitRequest {
            storage_folder: storage_folder.map(Path::to_path_buf),
        };
        let mut pending = self.begin(OpCode::Init, &request).await?;
        let never = CancellationToken::new();
        let reply = self.next_reply(&mut pending, &never).await?;
        match reply.opcode() {
            OpCode::Ack => Ok(()),
            other => Err(unexpected("Ack", other)),
        }
    }

    /// Enumerate devices through the worker, forwarding each as it arrives.
    pub async fn get_device_list(
        &mut self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        found: &mpsc::Sender<ScanDevice>,
    ) -> Result<(), WorkerError> {
        let mut pending = self.begin(OpCode::GetDeviceList, options).await?;
        loop {
            let reply = self.next_reply(&mut pending, cancel).await?;
            match reply.opcode() {
                OpCode::Done => return Ok(()),
                OpCode::Device => {
                    let device: ScanDevice = reply.decode()?;
                    if found.send(device).await.is_err() {
                        pending.stop = true;
                    }
                }
                other => return Err(unexpected("Device or Done", other)),
            }
        }
    }

    /// Run a scan through the worker.
    ///
    /// Cancelling `cancel` or dropping the receiver of `updates` sends a
    /// Cancel request; the worker then has the cancel grace period to
    /// finish before the scan fails with [`WorkerError::ForcedAbort`].
    pub async fn scan(
        &mut self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        updates: &mpsc::Sender<ScanUpdate>,
    ) -> Result<(), WorkerError> {
        let mut pending = self.begin(OpCode::Scan, options).await?;
        loop {
            let reply = self.next_reply(&mut pending, cancel).await?;
            let update = match reply.opcode() {
                OpCode::Done => return Ok(()),
                OpCode::PageStart => ScanUpdate::PageStart,
                OpCode::Progress => {
                    let progress: ProgressPayload = reply.decode()?;
                    ScanUpdate::Progress(progress.progress)
                }
                OpCode::Page => {
                    let page: PagePayload = reply.decode()?;
                    page.image.validate()?;
                    ScanUpdate::Page(page.image)
                }
                other => return Err(unexpected("scan update or Done", other)),
            };
            if !pending.stop && updates.send(update).await.is_err() {
                debug!("[Worker {}] Scan consumer went away", self.pid);
                pending.stop = true;
            }
        }
    }

    /// Stop reading from the channel.
    pub fn close(&mut self) {
        self.reader.abort();
    }

    async fn begin<T: serde::Serialize>(
        &mut self,
        opcode: OpCode,
        body: &T,
    ) -> Result<Pending, WorkerError> {
        if let Some(reason) = &self.aborted {
            return Err(WorkerError::ForcedAbort {
                pid: self.pid,
                reason: reason.clone(),
            });
        }
        let id = self.next_request_id;
        self.next_request_id += 1;
        write_message(&mut self.writer, &Message::json(opcode, id, body)?).await?;
        debug!("[Worker {}] -> {:?} #{}", self.pid, opcode, id);
        Ok(Pending {
            id,
            stop: false,
            cancel_deadline: None,
        })
    }

    /// Next stream message for `pending`, or its completion.
    ///
    /// Err replies are converted into errors here, so callers only see
    /// Done, Ack and stream items.
    async fn next_reply(
        &mut self,
        pending: &mut Pending,
        cancel: &CancellationToken,
    ) -> Result<Message, WorkerError> {
        loop {
            if pending.cancel_deadline.is_none() && (pending.stop || cancel.is_cancelled()) {
                self.send_cancel(pending).await?;
            }

            let deadline = self.deadline(pending);
            let waiting_for_cancel = pending.cancel_deadline.is_none();

            let next = tokio::select! {
                next = self.incoming.recv() => next,
                _ = cancel.cancelled(), if waiting_for_cancel => continue,
                _ = sleep_until(deadline) => {
                    let reason = if pending.cancel_deadline.is_some() {
                        format!("cancel not honoured within {:?}", self.timeouts.cancel_grace)
                    } else {
                        "worker stopped responding".to_string()
                    };
                    return Err(self.abort(reason));
                }
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ProtocolError::ChannelClosed.into()),
            };

            if message.request_id() != pending.id {
                debug!(
                    "[Worker {}] Ignoring stale {:?} for request #{}",
                    self.pid,
                    message.opcode(),
                    message.request_id()
                );
                continue;
            }

            if message.opcode() == OpCode::Err {
                let payload: ErrorPayload = message.decode()?;
                return Err(DriverError::from_payload(payload).into());
            }
            return Ok(message);
        }
    }

    async fn send_cancel(&mut self, pending: &mut Pending) -> Result<(), WorkerError> {
        info!("[Worker {}] Cancelling request #{}", self.pid, pending.id);
        write_message(&mut self.writer, &Message::empty(OpCode::Cancel, pending.id)).await?;
        pending.cancel_deadline = Some(Instant::now() + self.timeouts.cancel_grace);
        Ok(())
    }

    fn deadline(&self, pending: &Pending) -> Option<Instant> {
        let idle = self.timeouts.rpc_timeout.map(|t| Instant::now() + t);
        match (pending.cancel_deadline, idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn abort(&mut self, reason: String) -> WorkerError {
        warn!("[Worker {}] Forcibly aborting: {}", self.pid, reason);
        self.aborted = Some(reason.clone());
        WorkerError::ForcedAbort {
            pid: self.pid,
            reason,
        }
    }
}

impl Drop for WorkerServiceAdapter {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for WorkerServiceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerServiceAdapter")
            .field("pid", &self.pid)
            .field("next_request_id", &self.next_request_id)
            .field("aborted", &self.aborted)
            .finish()
    }
}

fn unexpected(expected: &'static str, got: OpCode) -> WorkerError {
    ProtocolError::UnexpectedMessage { expected, got }.into()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperflow_protocol::{read_message, Driver, FaultKind, ImagePayload, PixelFormat};
    use tokio::io::DuplexStream;

    fn adapter(timeouts: ChannelTimeouts) -> (WorkerServiceAdapter, DuplexStream) {
        let (parent, worker) = tokio::io::duplex(1 << 16);
        (WorkerServiceAdapter::new(7, Box::new(parent), timeouts), worker)
    }

    async fn expect_request(worker: &mut DuplexStream, opcode: OpCode) -> u64 {
        let message = read_message(worker).await.unwrap().unwrap();
        assert_eq!(message.opcode(), opcode);
        message.request_id()
    }

    async fn send(worker: &mut DuplexStream, message: Message) {
        write_message(worker, &message).await.unwrap();
    }

    #[tokio::test]
    async fn init_expects_ack() {
        let (mut adapter, mut worker) = adapter(ChannelTimeouts::default());
        let fake = tokio::spawn(async move {
            let id = expect_request(&mut worker, OpCode::Init).await;
            send(&mut worker, Message::empty(OpCode::Ack, id)).await;
            worker
        });
        adapter.init(Some(Path::new("/tmp"))).await.unwrap();
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn scan_forwards_updates_and_skips_stale_replies() {
        let (mut adapter, mut worker) = adapter(ChannelTimeouts::default());
        let fake = tokio::spawn(async move {
            let id = expect_request(&mut worker, OpCode::Scan).await;
            send(&mut worker, Message::empty(OpCode::PageStart, id + 100)).await;
            send(&mut worker, Message::empty(OpCode::PageStart, id)).await;
            send(
                &mut worker,
                Message::json(OpCode::Progress, id, &ProgressPayload { progress: 1.0 }).unwrap(),
            )
            .await;
            let image = ImagePayload {
                width: 1,
                height: 1,
                pixel_format: PixelFormat::Gray8,
                data: vec![9],
            };
            send(
                &mut worker,
                Message::json(OpCode::Page, id, &PagePayload { image }).unwrap(),
            )
            .await;
            send(&mut worker, Message::empty(OpCode::Done, id)).await;
            worker
        });

        let (tx, mut rx) = mpsc::channel(16);
        adapter
            .scan(&ScanOptions::for_driver(Driver::Sim), &CancellationToken::new(), &tx)
            .await
            .unwrap();
        drop(tx);
        fake.await.unwrap();

        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        assert_eq!(updates.len(), 3);
        assert!(matches!(updates[0], ScanUpdate::PageStart));
        assert!(matches!(updates[2], ScanUpdate::Page(ref p) if p.data == vec![9]));
    }

    #[tokio::test]
    async fn worker_error_becomes_driver_error() {
        let (mut adapter, mut worker) = adapter(ChannelTimeouts::default());
        let fake = tokio::spawn(async move {
            let id = expect_request(&mut worker, OpCode::Scan).await;
            let payload = ErrorPayload {
                kind: FaultKind::DeviceOffline,
                message: "lid open".to_string(),
            };
            send(&mut worker, Message::json(OpCode::Err, id, &payload).unwrap()).await;
            worker
        });
        let (tx, _rx) = mpsc::channel(4);
        let err = adapter
            .scan(&ScanOptions::default(), &CancellationToken::new(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Driver(DriverError::DeviceOffline(_))));
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_is_sent_and_done_ends_the_scan() {
        let (mut adapter, mut worker) = adapter(ChannelTimeouts::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let fake = tokio::spawn(async move {
            let id = expect_request(&mut worker, OpCode::Scan).await;
            let cancel_id = expect_request(&mut worker, OpCode::Cancel).await;
            assert_eq!(cancel_id, id);
            send(&mut worker, Message::empty(OpCode::Done, id)).await;
            worker
        });
        let (tx, _rx) = mpsc::channel(4);
        adapter
            .scan(&ScanOptions::default(), &cancel, &tx)
            .await
            .unwrap();
        fake.await.unwrap();
    }

    #[tokio::test]
    async fn ignored_cancel_forces_an_abort() {
        let (mut adapter, mut worker) = adapter(ChannelTimeouts {
            cancel_grace: Duration::from_millis(100),
            rpc_timeout: None,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let fake = tokio::spawn(async move {
            expect_request(&mut worker, OpCode::Scan).await;
            expect_request(&mut worker, OpCode::Cancel).await;
            // Keep the channel open without answering.
            tokio::time::sleep(Duration::from_secs(2)).await;
            worker
        });
        let (tx, _rx) = mpsc::channel(4);
        let err = adapter
            .scan(&ScanOptions::default(), &cancel, &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ForcedAbort { pid: 7, .. }));
        assert!(adapter.is_aborted());

        let again = adapter.init(None).await.unwrap_err();
        assert!(matches!(again, WorkerError::ForcedAbort { .. }));
        fake.abort();
    }

    #[tokio::test]
    async fn silent_worker_hits_rpc_timeout() {
        let (mut adapter, worker) = adapter(ChannelTimeouts {
            cancel_grace: DEFAULT_CANCEL_GRACE,
            rpc_timeout: Some(Duration::from_millis(100)),
        });
        let err = adapter.init(None).await.unwrap_err();
        assert!(matches!(err, WorkerError::ForcedAbort { .. }));
        drop(worker);
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let (mut adapter, worker) = adapter(ChannelTimeouts::default());
        drop(worker);
        let err = adapter.init(None).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Channel(ProtocolError::ChannelClosed) | WorkerError::Channel(ProtocolError::Io(_))
        ));
    }
}
