//! Serial port transport (feature `serial`)

use std::io;

use tokio::io::{ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use super::Transport;

#[derive(Debug, Clone)]
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
}

impl SerialTransport {
    #[must_use]
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
        }
    }
}

impl Transport for SerialTransport {
    type Reader = ReadHalf<SerialStream>;
    type Writer = WriteHalf<SerialStream>;

    async fn open(&mut self) -> io::Result<(Self::Reader, Self::Writer)> {
        let port = tokio_serial::new(&self.path, self.baud_rate)
            .open_native_async()
            .map_err(io::Error::from)?;
        debug!(port = %self.path, baud = self.baud_rate, "serial transport opened");
        Ok(tokio::io::split(port))
    }

    fn describe(&self) -> String {
        format!("serial {} @ {}", self.path, self.baud_rate)
    }
}
