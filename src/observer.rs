//! Passive view of the proxy's own TCP traffic.

use std::{
    fmt,
    net::SocketAddrV4,
    time::Duration,
};

use bytes::Bytes;
use crossbeam::{
    channel::{self, Receiver},
    select,
};
use log::{debug, error, info};

use crate::{
    capture::CaptureError,
    decoder::PacketDecoder,
    Config,
};

pub enum CaptureEvent {
    /// One raw IPv4 frame, header included.
    Frame(Bytes),
    Error(CaptureError),
    Close,
}

/// Source of raw IPv4 frames that may stop delivering until resumed.
pub trait Capture {
    fn events(&self) -> &Receiver<CaptureEvent>;
    fn recv_paused(&self) -> bool;
    fn resume_recv(&self);
}

/// One observed TCP pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserverSummary {
    pub frames: u64,
    pub flows: u64,
    pub errors: u64,
}

pub struct PacketObserver {
    port: u16,
    tick: Duration,
}

impl PacketObserver {
    pub fn new(config: &Config) -> Self {
        Self {
            port: config.port,
            tick: config.observer_tick,
        }
    }

    /// Decodes `frame` and logs it when it belongs to the proxy port.
    pub fn inspect(&self, frame: &[u8]) -> Option<Flow> {
        let packet = match PacketDecoder::new(frame).decode() {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping undecodable frame: {e}");
                return None;
            }
        };
        let tcp = packet.tcp?;
        if tcp.source_port != self.port && tcp.destination_port != self.port {
            return None;
        }

        let flow = Flow {
            source: SocketAddrV4::new(packet.ip.source, tcp.source_port),
            destination: SocketAddrV4::new(packet.ip.destination, tcp.destination_port),
        };
        debug!("received {} bytes from {}", frame.len(), packet.ip.source);
        info!("{flow}");
        Some(flow)
    }

    /// Observes until the capture closes.
    pub fn run<C: Capture>(&self, capture: &C) -> ObserverSummary {
        let ticker = channel::tick(self.tick);
        let mut summary = ObserverSummary::default();
        loop {
            select! {
                recv(capture.events()) -> event => match event {
                    Ok(CaptureEvent::Frame(frame)) => {
                        summary.frames += 1;
                        if self.inspect(&frame).is_some() {
                            summary.flows += 1;
                        }
                    }
                    Ok(CaptureEvent::Error(e)) => {
                        summary.errors += 1;
                        error!("{e}");
                        debug!("{e:?}");
                    }
                    Ok(CaptureEvent::Close) | Err(_) => {
                        info!("capture socket closed");
                        break;
                    }
                },
                recv(ticker) -> _ => {
                    if capture.recv_paused() {
                        debug!("unpause capture");
                        capture.resume_recv();
                    }
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
    };

    use crossbeam::channel::Sender;
    use etherparse::{IpNumber, Ipv4Header, TcpHeader};

    use super::*;

    fn frame(src_port: u16, dst_port: u16, protocol: IpNumber) -> Bytes {
        let tcp = TcpHeader::new(src_port, dst_port, 1, 1024);
        let ip = Ipv4Header::new(
            tcp.header_len() as u16,
            64,
            protocol,
            [127, 0, 0, 1],
            [10, 1, 2, 3],
        )
        .unwrap();
        let mut buf = Vec::new();
        ip.write(&mut buf).unwrap();
        tcp.write(&mut buf).unwrap();
        Bytes::from(buf)
    }

    fn observer(port: u16) -> PacketObserver {
        PacketObserver::new(&Config {
            observer_tick: Duration::from_millis(5),
            ..Config::new("127.0.0.1", port)
        })
    }

    struct FakeCapture {
        events: Receiver<CaptureEvent>,
        paused: AtomicBool,
        resumed: AtomicUsize,
    }

    impl FakeCapture {
        fn new(paused: bool) -> (Self, Sender<CaptureEvent>) {
            let (tx, events) = channel::unbounded();
            let capture = Self {
                events,
                paused: AtomicBool::new(paused),
                resumed: AtomicUsize::new(0),
            };
            (capture, tx)
        }
    }

    impl Capture for FakeCapture {
        fn events(&self) -> &Receiver<CaptureEvent> {
            &self.events
        }

        fn recv_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }

        fn resume_recv(&self) {
            self.paused.store(false, Ordering::SeqCst);
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn matches_either_port() {
        let observer = observer(8080);
        let out = observer.inspect(&frame(51000, 8080, IpNumber::TCP)).unwrap();
        assert_eq!(out.source, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 51000));
        assert_eq!(out.destination, SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 8080));
        assert_eq!(out.to_string(), "127.0.0.1:51000 -> 10.1.2.3:8080");

        assert!(observer.inspect(&frame(8080, 51000, IpNumber::TCP)).is_some());
    }

    #[test]
    fn ignores_other_traffic() {
        let observer = observer(8080);
        assert_eq!(observer.inspect(&frame(1234, 80, IpNumber::TCP)), None);
        assert_eq!(observer.inspect(&frame(8080, 8080, IpNumber::UDP)), None);
        assert_eq!(observer.inspect(&[0x45, 0x00]), None);
    }

    #[test]
    fn run_counts_until_close() {
        let (capture, tx) = FakeCapture::new(false);
        tx.send(CaptureEvent::Frame(frame(1234, 8080, IpNumber::TCP))).unwrap();
        tx.send(CaptureEvent::Frame(frame(1234, 80, IpNumber::TCP))).unwrap();
        tx.send(CaptureEvent::Error(CaptureError::from(std::io::Error::other("boom"))))
            .unwrap();
        tx.send(CaptureEvent::Frame(frame(8080, 4321, IpNumber::TCP))).unwrap();
        tx.send(CaptureEvent::Close).unwrap();

        let summary = observer(8080).run(&capture);
        assert_eq!(
            summary,
            ObserverSummary {
                frames: 3,
                flows: 2,
                errors: 1
            }
        );
    }

    #[test]
    fn run_stops_when_capture_goes_away() {
        let (capture, tx) = FakeCapture::new(false);
        drop(tx);
        assert_eq!(observer(8080).run(&capture), ObserverSummary::default());
    }

    #[test]
    fn tick_resumes_paused_capture() {
        let (capture, tx) = FakeCapture::new(true);
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            tx.send(CaptureEvent::Close).unwrap();
        });
        observer(8080).run(&capture);
        closer.join().unwrap();

        assert!(!capture.recv_paused());
        assert_eq!(capture.resumed.load(Ordering::SeqCst), 1);
    }
}
