use std::time::Instant;

use tracing::{debug, warn};

use super::{io_bridge, SecureDataSource};
use crate::channel::{ReadMode, SecureChannel, TerminateReport};
use crate::config::ClientConfig;
use crate::crypto::CryptoProvider;
use crate::error::{ConfigError, Error};
use crate::transport::RawTransport;

pub struct ClientSource<T: RawTransport, P: CryptoProvider> {
    transport: T,
    channel: SecureChannel<P>,
    config: ClientConfig,
}

impl<T: RawTransport, P: CryptoProvider> ClientSource<T, P> {
    pub fn new(transport: T, provider: P, config: ClientConfig) -> Self {
        let channel = SecureChannel::new(
            format!("client:{}", config.target),
            provider,
            config.channel.clone(),
        );
        Self {
            transport,
            channel,
            config,
        }
    }

    pub fn channel(&self) -> &SecureChannel<P> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut SecureChannel<P> {
        &mut self.channel
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.channel.negotiated_protocol()
    }

    /// Gives the transport back. Call [`SecureDataSource::terminate`] first.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: RawTransport, P: CryptoProvider> SecureDataSource for ClientSource<T, P> {
    fn setup(&mut self) -> Result<(), Error> {
        if !self.transport.is_connected() {
            return Err(ConfigError::NotConnected.into());
        }
        let deadline = Instant::now() + self.config.channel.handshake_timeout;
        self.channel.connect_client(
            &mut self.transport,
            &self.config.target,
            &self.config.protocols,
            self.config.certificate.as_ref(),
            deadline,
        )?;
        debug!(
            channel = self.channel.name(),
            protocol = ?self.channel.negotiated_protocol(),
            "client source ready"
        );
        Ok(())
    }

    fn get_data(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let deadline = Instant::now() + self.config.channel.read_timeout;
        self.channel
            .read(&mut self.transport, buf, deadline, ReadMode::AllowPartial)
    }

    fn put_data(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.channel.write(&mut self.transport, buf)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected() && self.channel.state().is_established()
    }

    fn terminate(&mut self) -> TerminateReport {
        let mut report = self.channel.terminate(&mut self.transport);
        if self.config.close_transport {
            if let Err(err) = self.transport.close() {
                warn!(channel = self.channel.name(), %err, "could not close transport");
                report.errors.push(err.into());
            }
        }
        report
    }
}

io_bridge!(ClientSource);

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::channel::SessionState;
    use crate::config::{ChannelConfig, ServerConfig};
    use crate::crypto::RingProvider;
    use crate::source::ServerSource;
    use crate::test::{self, ScriptedTransport};
    use crate::transport::TcpTransport;

    fn spawn_echo_server(
        provider: RingProvider,
    ) -> (std::net::SocketAddr, thread::JoinHandle<TerminateReport>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let transport = TcpTransport::new(stream).unwrap();
            let config = ServerConfig::new(test::server_cert()).close_transport(true);
            let mut source = ServerSource::new(transport, provider, config);
            source.setup().unwrap();

            let mut buf = [0u8; 1024];
            loop {
                let count = source.get_data(&mut buf).unwrap();
                if count == 0 {
                    break;
                }
                source.put_data(&buf[..count]).unwrap();
            }
            assert!(source.channel().peer_closed());
            source.terminate()
        });
        (addr, handle)
    }

    #[test]
    fn test_echo_over_tcp() {
        let (server_provider, client_provider) = test::providers();
        let (addr, server) = spawn_echo_server(server_provider);

        let transport = TcpTransport::connect(addr, Duration::from_secs(5)).unwrap();
        let config = ClientConfig::new(test::TARGET)
            .protocols(["http/1.1"])
            .close_transport(true);
        let mut source = ClientSource::new(transport, client_provider, config);
        source.setup().unwrap();
        assert!(source.is_connected());
        assert_eq!(source.negotiated_protocol(), Some("http/1.1"));

        let message = vec![0x42u8; 40_000];
        source.write_all(&message).unwrap();
        let mut echoed = vec![0u8; message.len()];
        source.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, message);

        let report = source.terminate();
        assert!(report.close_sent);
        assert!(report.is_clean());
        assert!(!source.transport().is_connected());
        assert_eq!(source.channel().state(), SessionState::Closed);

        let server_report = server.join().unwrap();
        assert!(!server_report.close_sent);
    }

    #[test]
    fn test_setup_requires_connected_transport() {
        let (_, client_provider) = test::providers();
        let mut transport = ScriptedTransport::new(Vec::new());
        transport.connected = false;

        let mut source = ClientSource::new(transport, client_provider, ClientConfig::new(test::TARGET));
        assert!(matches!(
            source.setup(),
            Err(Error::Configuration(ConfigError::NotConnected))
        ));
        assert!(!source.is_connected());
    }

    #[test]
    fn test_read_timeout_is_not_end_of_stream() {
        let test::Pair {
            client,
            client_transport,
            server,
            server_transport,
        } = test::handshake_pair(&[]);
        let config = ClientConfig::new(test::TARGET)
            .channel(ChannelConfig::default().read_timeout(Duration::from_millis(20)));
        let mut source = ClientSource {
            transport: client_transport,
            channel: client,
            config,
        };

        let mut buf = [0u8; 8];
        assert_eq!(source.get_data(&mut buf).unwrap(), 0);
        let err = source.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert!(source.is_connected());

        assert!(source.terminate().is_clean());
        drop((server, server_transport));
    }

    #[test]
    fn test_lost_transport_aborts_read() {
        let test::Pair {
            client,
            client_transport,
            server,
            server_transport,
        } = test::handshake_pair(&[]);
        let config = ClientConfig::new(test::TARGET)
            .channel(ChannelConfig::default().read_timeout(Duration::from_millis(20)));
        let mut source = ClientSource {
            transport: client_transport,
            channel: client,
            config,
        };
        drop((server, server_transport));

        let mut buf = [0u8; 8];
        let err = source.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
        assert!(!source.transport().is_connected());
        assert!(!source.channel().peer_closed());

        let err = source.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
    }
}
