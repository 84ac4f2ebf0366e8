use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use super::Backend;
use crate::error::BoxError;
use crate::param::{ConnectParams, ParamMap, Parameter};

/// Plain TCP connection to `<NAME>_HOST:<NAME>_PORT`.
///
/// `<NAME>_CONNECT_TIMEOUT_MS` (default 5000) bounds each address attempt
/// and becomes the stream's read/write timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

impl Backend for HostBackend {
    type Connection = TcpStream;

    const KIND: &'static str = "host";

    fn param_map(&self, prefix: &str) -> ParamMap {
        ParamMap::new([
            ("host", Parameter::string(format!("{prefix}_HOST")).non_empty()),
            ("port", Parameter::unsigned(format!("{prefix}_PORT")).within(1, 65_535)),
            (
                "connect_timeout_ms",
                Parameter::unsigned(format!("{prefix}_CONNECT_TIMEOUT_MS")).with_default(5000),
            ),
        ])
    }

    fn open(&self, params: &ConnectParams) -> Result<TcpStream, BoxError> {
        let host = params.require_str("host")?;
        let port = u16::try_from(params.require_u64("port")?)?;
        let timeout = Duration::from_millis(params.require_u64("connect_timeout_ms")?.max(1));

        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    debug!(%addr, "tcp connection opened");
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(%addr, error = %err, "tcp connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{host}:{port} resolved to no addresses"),
                )
            })
            .into())
    }

    fn release(&self, connection: TcpStream) -> Result<(), BoxError> {
        match connection.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err.into()),
            _ => Ok(()),
        }
    }
}
