use std::sync::Mutex;

use etherparse::{IpNumber, Ipv4Header, TcpHeader};
use log::{Level, LevelFilter, Log, Metadata, Record};
use snoop_proxy::{Config, PacketObserver};

static LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());

struct Recorder;

impl Log for Recorder {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            LINES.lock().unwrap().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

fn frame(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16) -> Vec<u8> {
    let tcp = TcpHeader::new(src_port, dst_port, 7, 512);
    let ip = Ipv4Header::new(tcp.header_len() as u16, 64, IpNumber::TCP, src, dst).unwrap();
    let mut buf = Vec::new();
    ip.write(&mut buf).unwrap();
    tcp.write(&mut buf).unwrap();
    buf
}

fn take_lines() -> Vec<String> {
    std::mem::take(&mut *LINES.lock().unwrap())
}

// Single test: the logger is process-wide.
#[test]
fn only_proxy_flows_are_logged() {
    log::set_logger(&Recorder).unwrap();
    log::set_max_level(LevelFilter::Info);
    let observer = PacketObserver::new(&Config::new("127.0.0.1", 8080));

    observer.inspect(&frame([192, 168, 1, 10], 1234, [93, 184, 216, 34], 80));
    assert!(take_lines().is_empty());

    observer.inspect(&frame([192, 168, 1, 10], 1234, [127, 0, 0, 1], 8080));
    assert_eq!(take_lines(), vec!["192.168.1.10:1234 -> 127.0.0.1:8080"]);

    observer.inspect(&frame([127, 0, 0, 1], 8080, [192, 168, 1, 10], 1234));
    assert_eq!(take_lines(), vec!["127.0.0.1:8080 -> 192.168.1.10:1234"]);
}
