//! Worker host: serves driver requests from the parent over the channel.

use paperflow_protocol::defaults::{HANDSHAKE_ERROR, HANDSHAKE_READY, WORKER_SUBCOMMAND};
use paperflow_protocol::{
    write_message, ErrorPayload, FaultKind, InitRequest, Message, OpCode, PagePayload,
    ProgressPayload, ScanDevice, ScanOptions,
};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::driver::{DriverRegistry, ScanUpdate, UpdateSink};
use crate::error::{DriverError, WorkerError};
use crate::transport::{spawn_message_reader, ChannelListener, Incoming};

const UPDATE_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct WorkerServiceConfig {
    pub parent_pid: u32,
    pub drivers: DriverRegistry,
}

/// Parse worker arguments: `[worker] <parent-pid>`.
pub fn parse_parent_pid<S: AsRef<str>>(args: &[S]) -> Result<u32, String> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let pid = match args.as_slice() {
        [pid] => pid,
        [sub, pid] if *sub == WORKER_SUBCOMMAND => pid,
        _ => return Err(format!("expected '[{}] <parent-pid>'", WORKER_SUBCOMMAND)),
    };
    pid.parse::<u32>()
        .map_err(|_| format!("invalid parent pid: '{}'", pid))
}

/// Run the worker host until the parent disconnects or goes away.
///
/// Prints the handshake line on stdout once the channel is listening.
pub async fn run_worker(config: WorkerServiceConfig) -> anyhow::Result<()> {
    let pid = std::process::id();
    let mut listener = match ChannelListener::bind(pid) {
        Ok(listener) => listener,
        Err(e) => {
            error!("[Worker {}] Could not open channel: {}", pid, e);
            print_handshake(HANDSHAKE_ERROR)?;
            return Err(e.into());
        }
    };
    print_handshake(HANDSHAKE_READY)?;
    info!(
        "[Worker {}] Serving parent {} ({:?})",
        pid, config.parent_pid, config.drivers
    );

    let serve = async {
        let stream = listener.accept().await?;
        debug!("[Worker {}] Parent connected", pid);
        serve_connection(stream, &config.drivers).await?;
        anyhow::Ok(())
    };

    tokio::select! {
        result = serve => {
            info!("[Worker {}] Channel closed", pid);
            result
        }
        _ = wait_for_parent_exit() => {
            info!("[Worker {}] Parent lifeline closed, exiting", pid);
            Ok(())
        }
    }
}

fn print_handshake(line: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()
}

/// Resolves when stdin reaches EOF, i.e. the parent closed or died.
async fn wait_for_parent_exit() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 64];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

/// Serve requests on one connection until the parent closes it.
pub async fn serve_connection<S>(stream: S, drivers: &DriverRegistry) -> Result<(), WorkerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (mut incoming, reader_task) = spawn_message_reader(reader);

    let result = serve_requests(&mut writer, &mut incoming, drivers).await;

    reader_task.abort();
    let _ = writer.shutdown().await;
    result
}

async fn serve_requests<S: AsyncWrite>(
    writer: &mut WriteHalf<S>,
    incoming: &mut Incoming,
    drivers: &DriverRegistry,
) -> Result<(), WorkerError> {
    let mut storage_folder: Option<PathBuf> = None;

    while let Some(next) = incoming.recv().await {
        let message = next?;
        let id = message.request_id();
        debug!("<- {:?} #{}", message.opcode(), id);

        match message.opcode() {
            OpCode::Init => {
                let request: InitRequest = message.decode()?;
                handle_init(writer, id, request, &mut storage_folder).await?;
            }
            OpCode::GetDeviceList => {
                let options: ScanOptions = message.decode()?;
                list_devices(writer, id, options, drivers).await?;
            }
            OpCode::Scan => {
                let options: ScanOptions = message.decode()?;
                run_scan(writer, incoming, id, options, drivers).await?;
            }
            OpCode::Cancel => {
                debug!("Cancel for #{} arrived after the request finished", id);
            }
            other => {
                warn!("Unexpected {:?} from parent", other);
                let payload = ErrorPayload {
                    kind: FaultKind::Internal,
                    message: format!("unexpected request {:?}", other),
                };
                send(writer, Message::json(OpCode::Err, id, &payload)?).await?;
            }
        }
    }

    Ok(())
}

async fn send<S: AsyncWrite>(writer: &mut WriteHalf<S>, message: Message) -> Result<(), WorkerError> {
    write_message(writer, &message).await?;
    Ok(())
}

async fn send_fault<S: AsyncWrite>(
    writer: &mut WriteHalf<S>,
    id: u64,
    fault: &DriverError,
) -> Result<(), WorkerError> {
    send(writer, Message::json(OpCode::Err, id, &fault.to_payload())?).await
}

async fn handle_init<S: AsyncWrite>(
    writer: &mut WriteHalf<S>,
    id: u64,
    request: InitRequest,
    storage_folder: &mut Option<PathBuf>,
) -> Result<(), WorkerError> {
    if let Some(folder) = &request.storage_folder {
        if !folder.is_dir() {
            let fault = DriverError::Fault(format!(
                "storage folder is not a directory: {}",
                folder.display()
            ));
            return send_fault(writer, id, &fault).await;
        }
    }
    debug!("Storage folder: {:?}", request.storage_folder);
    *storage_folder = request.storage_folder;
    send(writer, Message::empty(OpCode::Ack, id)).await
}

async fn list_devices<S: AsyncWrite>(
    writer: &mut WriteHalf<S>,
    id: u64,
    options: ScanOptions,
    drivers: &DriverRegistry,
) -> Result<(), WorkerError> {
    let driver = match drivers.get(options.driver) {
        Ok(driver) => driver,
        Err(fault) => return send_fault(writer, id, &fault).await,
    };

    let (tx, mut rx) = mpsc::channel::<ScanDevice>(UPDATE_CAPACITY);
    let task = tokio::task::spawn_blocking(move || {
        driver.get_devices(&options, &CancellationToken::new(), &mut |device| {
            let _ = tx.blocking_send(device);
        })
    });

    while let Some(device) = rx.recv().await {
        send(writer, Message::json(OpCode::Device, id, &device)?).await?;
    }

    match task.await {
        Ok(Ok(())) => send(writer, Message::empty(OpCode::Done, id)).await,
        Ok(Err(fault)) => send_fault(writer, id, &fault).await,
        Err(join) => send_fault(writer, id, &DriverError::Fault(join.to_string())).await,
    }
}

async fn run_scan<S: AsyncWrite>(
    writer: &mut WriteHalf<S>,
    incoming: &mut Incoming,
    id: u64,
    options: ScanOptions,
    drivers: &DriverRegistry,
) -> Result<(), WorkerError> {
    let driver = match drivers.get(options.driver) {
        Ok(driver) => driver,
        Err(fault) => return send_fault(writer, id, &fault).await,
    };

    let cancel = CancellationToken::new();
    let driver_cancel = cancel.clone();
    let (tx, mut rx) = mpsc::channel(UPDATE_CAPACITY);
    let task = tokio::task::spawn_blocking(move || {
        let mut sink = UpdateSink::new(tx);
        driver.scan(&options, &driver_cancel, &mut sink)
    });

    let mut parent_connected = true;
    let mut pages = 0u32;
    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else { break };
                let message = match update {
                    ScanUpdate::PageStart => Message::empty(OpCode::PageStart, id),
                    ScanUpdate::Progress(progress) => {
                        Message::json(OpCode::Progress, id, &ProgressPayload { progress })?
                    }
                    ScanUpdate::Page(image) => {
                        pages += 1;
                        Message::json(OpCode::Page, id, &PagePayload { image })?
                    }
                };
                if let Err(e) = send(writer, message).await {
                    cancel.cancel();
                    return Err(e);
                }
            }
            next = incoming.recv(), if parent_connected => match next {
                Some(Ok(message)) if message.opcode() == OpCode::Cancel && message.request_id() == id => {
                    info!("Scan #{} cancelled by parent", id);
                    cancel.cancel();
                }
                Some(Ok(message)) => {
                    warn!("Ignoring {:?} #{} during scan", message.opcode(), message.request_id());
                }
                Some(Err(_)) | None => {
                    warn!("Parent channel closed during scan #{}", id);
                    parent_connected = false;
                    cancel.cancel();
                }
            }
        }
    }

    let outcome = task.await;
    debug!("Scan #{} produced {} page(s)", id, pages);
    match outcome {
        Ok(Ok(())) | Ok(Err(DriverError::Disconnected)) => {
            send(writer, Message::empty(OpCode::Done, id)).await
        }
        Ok(Err(fault)) => {
            warn!("Scan #{} failed: {}", id, fault);
            send_fault(writer, id, &fault).await
        }
        Err(join) => send_fault(writer, id, &DriverError::Fault(join.to_string())).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_pid_accepts_both_launch_forms() {
        assert_eq!(parse_parent_pid(&["worker", "123"]), Ok(123));
        assert_eq!(parse_parent_pid(&["456"]), Ok(456));
        assert!(parse_parent_pid(&["scan", "1"]).is_err());
        assert!(parse_parent_pid(&["worker", "abc"]).is_err());
        assert!(parse_parent_pid::<&str>(&[]).is_err());
    }
}
