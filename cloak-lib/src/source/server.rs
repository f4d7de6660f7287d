use std::time::Instant;

use tracing::{debug, warn};

use super::{io_bridge, SecureDataSource};
use crate::channel::{ReadMode, SecureChannel, TerminateReport};
use crate::config::ServerConfig;
use crate::crypto::CryptoProvider;
use crate::error::{ConfigError, Error};
use crate::transport::RawTransport;

pub struct ServerSource<T: RawTransport, P: CryptoProvider> {
    transport: T,
    channel: SecureChannel<P>,
    config: ServerConfig,
}

impl<T: RawTransport, P: CryptoProvider> ServerSource<T, P> {
    pub fn new(transport: T, provider: P, config: ServerConfig) -> Self {
        let channel = SecureChannel::new(
            format!("server:{}", config.certificate.common_name),
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

    /// Asks the client for fresh keys; completes during a later [`SecureDataSource::get_data`].
    pub fn request_renegotiation(&mut self) -> Result<(), Error> {
        self.channel.request_renegotiation(&mut self.transport)
    }

    /// Gives the transport back. Call [`SecureDataSource::terminate`] first.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: RawTransport, P: CryptoProvider> SecureDataSource for ServerSource<T, P> {
    fn setup(&mut self) -> Result<(), Error> {
        if !self.transport.is_connected() {
            return Err(ConfigError::NotConnected.into());
        }
        let deadline = Instant::now() + self.config.channel.handshake_timeout;
        self.channel
            .connect_server(&mut self.transport, Some(&self.config.certificate), deadline)?;
        debug!(channel = self.channel.name(), "server source ready");
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

io_bridge!(ServerSource);
