// SPDX-License-Identifier: AGPL-3.0-only

//! Tracing subscriber setup: text or JSON to stderr, optionally mirrored to
//! a UDP log server.

use crate::config::Config;
use anyhow::{Context, Result};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub fn init_logging(config: &Config) -> Result<()> {
    let level = Level::from_str(&config.log_level).unwrap_or(Level::INFO);
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level);

    let udp_writer = config
        .log_server
        .as_deref()
        .map(UdpMakeWriter::connect)
        .transpose()?;

    match (config.json_log, udp_writer) {
        (false, None) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_timer(UtcTime::rfc_3339()),
                )
                .init();
        }
        (true, None) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_timer(UtcTime::rfc_3339())
                        .json()
                        .flatten_event(true),
                )
                .init();
        }
        (false, Some(udp)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_timer(UtcTime::rfc_3339()),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(udp)
                        .with_timer(UtcTime::rfc_3339())
                        .with_ansi(false)
                        .boxed(),
                )
                .init();
        }
        (true, Some(udp)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_timer(UtcTime::rfc_3339())
                        .json()
                        .flatten_event(true),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(udp)
                        .with_timer(UtcTime::rfc_3339())
                        .json()
                        .flatten_event(true)
                        .boxed(),
                )
                .init();
        }
    }

    Ok(())
}

/// Best-effort line shipping to a UDP collector. Send errors are swallowed:
/// losing a log line must never take the init process down.
#[derive(Clone)]
struct UdpMakeWriter {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl UdpMakeWriter {
    fn connect(server: &str) -> Result<Self> {
        let target = server
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve log server {server}"))?
            .next()
            .with_context(|| format!("log server {server} resolved to no addresses"))?;
        let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind UDP log socket")?;

        Ok(Self {
            socket: Arc::new(socket),
            target,
        })
    }
}

impl io::Write for UdpMakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.socket.send_to(buf, self.target);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for UdpMakeWriter {
    type Writer = UdpMakeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_udp_writer_ships_lines() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap();

        let mut writer = UdpMakeWriter::connect(&addr.to_string()).unwrap();
        writer.write_all(b"log line\n").unwrap();

        let mut buf = [0u8; 64];
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"log line\n");
    }

    #[test]
    fn test_unresolvable_log_server_is_an_error() {
        assert!(UdpMakeWriter::connect("definitely-not-a-host.invalid:99999").is_err());
    }
}
