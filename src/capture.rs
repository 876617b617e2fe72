use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{debug, info};
use pnet::{
    packet::{ip::IpNextHeaderProtocols, Packet},
    transport::{ipv4_packet_iter, transport_channel, TransportChannelType, TransportReceiver},
};

use crate::observer::{Capture, CaptureEvent};

const RAW_BUFFER_SIZE: usize = 65535;
const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
#[error("packet capture failed")]
pub struct CaptureError(#[from] io::Error);

/// Raw IPv4 socket receiving every TCP segment seen by the host.
///
/// Frames are queued for the observer; a full queue pauses the reader until
/// [`Capture::resume_recv`] is called.
pub struct PnetCapture {
    events: Receiver<CaptureEvent>,
    paused: Arc<AtomicBool>,
    resume: Sender<()>,
}

impl PnetCapture {
    pub fn open(queue: usize) -> Result<PnetCapture, CaptureError> {
        let (_, rx) = transport_channel(
            RAW_BUFFER_SIZE,
            TransportChannelType::Layer3(IpNextHeaderProtocols::Tcp),
        )?;
        info!("raw capture socket opened");

        let (tx, events) = channel::bounded(queue.max(1));
        let (resume, resumed) = channel::bounded(1);
        let paused = Arc::new(AtomicBool::new(false));

        let reader_paused = Arc::clone(&paused);
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || receive(rx, tx, reader_paused, resumed))?;

        Ok(Self {
            events,
            paused,
            resume,
        })
    }
}

impl Capture for PnetCapture {
    fn events(&self) -> &Receiver<CaptureEvent> {
        &self.events
    }

    fn recv_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn resume_recv(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            let _ = self.resume.try_send(());
        }
    }
}

fn receive(
    mut rx: TransportReceiver,
    tx: Sender<CaptureEvent>,
    paused: Arc<AtomicBool>,
    resumed: Receiver<()>,
) {
    let mut packets = ipv4_packet_iter(&mut rx);
    let mut failures = 0u32;
    loop {
        let event = match packets.next() {
            Ok((packet, _)) => {
                failures = 0;
                CaptureEvent::Frame(Bytes::copy_from_slice(packet.packet()))
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                CaptureEvent::Error(e.into())
            }
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                paused.store(true, Ordering::Release);
                debug!("capture queue full, receive paused");
                if resumed.recv().is_err() || tx.send(event).is_err() {
                    break;
                }
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
        if failures > 0 {
            thread::sleep(error_backoff(failures));
        }
    }
    debug!("capture reader stopped");
    let _ = tx.try_send(CaptureEvent::Close);
}

/// Pause after `failures` consecutive receive errors, doubling up to a ceiling.
fn error_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    ERROR_BACKOFF_BASE
        .saturating_mul(1 << exp)
        .min(ERROR_BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        assert_eq!(error_backoff(1), Duration::from_millis(10));
        assert_eq!(error_backoff(2), Duration::from_millis(20));
        assert_eq!(error_backoff(4), Duration::from_millis(80));
        assert_eq!(error_backoff(8), ERROR_BACKOFF_MAX);
        assert_eq!(error_backoff(u32::MAX), ERROR_BACKOFF_MAX);
    }
}
