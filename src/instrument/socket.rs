//! Raw SCPI over TCP (LXI socket service, port 5025).

use super::ScpiTransport;
use crate::error::MeasurementError;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Blocking line-oriented transport over a TCP stream.
pub struct SocketTransport {
    peer: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    terminator: String,
}

impl SocketTransport {
    /// Connect with `timeout` applied to the connect, every read and every write.
    pub fn connect(host: &str, port: u16, timeout: Duration, terminator: &str) -> io::Result<Self> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}:{}", host, port),
            )
        })?;

        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;

        debug!("SCPI socket open to {} (timeout {:?})", addr, timeout);
        Ok(Self {
            peer: addr.to_string(),
            reader: BufReader::new(stream),
            writer,
            terminator: terminator.to_string(),
        })
    }
}

impl ScpiTransport for SocketTransport {
    fn write(&mut self, command: &str) -> Result<(), MeasurementError> {
        let line = format!("{}{}", command, self.terminator);
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        debug!("[{}] -> {}", self.peer, command);
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, MeasurementError> {
        self.write(command)?;

        let mut response = String::new();
        let read = self.reader.read_line(&mut response)?;
        if read == 0 {
            return Err(MeasurementError::Transport(format!(
                "connection to {} closed by instrument",
                self.peer
            )));
        }

        let response = response.trim_end_matches(['\r', '\n']).to_string();
        debug!("[{}] <- {}", self.peer, response);
        Ok(response)
    }

    fn close(&mut self) -> Result<(), MeasurementError> {
        match self.writer.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Minimal line-based SCPI responder on an ephemeral port.
    fn spawn_fake_meter(reply: &'static str) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut received = Vec::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let command = line.trim().to_string();
                if command.contains('?') {
                    writer.write_all(reply.as_bytes()).unwrap();
                }
                received.push(command);
            }
            received
        });
        (port, handle)
    }

    #[test]
    fn test_query_round_trip_over_tcp() {
        let (port, server) = spawn_fake_meter("+1.23456700E+00\n");
        let mut transport =
            SocketTransport::connect("127.0.0.1", port, Duration::from_secs(2), "\n").unwrap();

        transport.write("CONF:VOLT:DC").unwrap();
        let response = transport.query("MEAS:VOLT:DC?").unwrap();
        assert_eq!(response, "+1.23456700E+00");

        transport.close().unwrap();
        let received = server.join().unwrap();
        assert_eq!(received, vec!["CONF:VOLT:DC", "MEAS:VOLT:DC?"]);
    }

    #[test]
    fn test_closed_peer_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut transport =
            SocketTransport::connect("127.0.0.1", port, Duration::from_secs(2), "\n").unwrap();
        server.join().unwrap();

        let err = transport.query("MEAS:RES?").unwrap_err();
        assert!(matches!(err, MeasurementError::Transport(_)));
    }
}
