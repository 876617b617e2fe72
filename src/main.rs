use std::{sync::Arc, thread};

use log::{info, warn, LevelFilter};
use snoop_proxy::{config, Config, PacketObserver, PnetCapture, Proxy};

use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, ValueEnum, Default, PartialEq)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Error,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[clap(rename_all = "kebab_case")]
struct Opts {
    /// Host name of the proxy, also the address to listen on
    #[arg(long, env = "HOST_NAME", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "SERVER_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Minimum level of log lines to print
    #[arg(short, long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info, ignore_case = true)]
    log_level: LogLevel,

    /// Log TCP packets going to or from the proxy port (needs raw socket privileges)
    #[arg(short, long, env = "TRACE_TCP_PACKETS")]
    trace_packets: bool,

    /// Number of concurrent relay sessions
    #[arg(short, long, env = "PROXY_WORKERS", default_value_t = config::DEFAULT_WORKERS)]
    workers: usize,
}

impl From<Opts> for Config {
    fn from(opts: Opts) -> Self {
        Config {
            host: opts.host,
            port: opts.port,
            log_level: opts.log_level.filter(),
            trace_packets: opts.trace_packets,
            workers: opts.workers,
            ..Default::default()
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(Config::from(Opts::parse()));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    let proxy = Proxy::bind(Arc::clone(&config))?;
    info!(
        "proxy server running at http://{}:{}",
        config.host,
        proxy.local_addr()?.port()
    );

    thread::scope(|s| {
        if config.trace_packets {
            s.spawn(|| trace_packets(&config));
        }
        proxy.run();
    });

    Ok(())
}

fn trace_packets(config: &Config) {
    let capture = match PnetCapture::open(config.capture_queue) {
        Ok(capture) => capture,
        Err(e) => {
            warn!("packet tracing disabled: {e}");
            if let Some(source) = std::error::Error::source(&e) {
                warn!("caused by: {source}");
            }
            return;
        }
    };
    let summary = PacketObserver::new(config).run(&capture);
    info!(
        "packet tracing stopped after {} frames ({} flows, {} errors)",
        summary.frames, summary.flows, summary.errors
    );
}
