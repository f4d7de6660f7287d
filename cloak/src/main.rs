use std::io::{self, BufRead, Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use cloak_lib::config::{CertSource, CertificateRef, ClientConfig, ServerConfig};
use cloak_lib::crypto::{generate_signing_key_pkcs8, signing_public_key, RingProvider};
use cloak_lib::source::{ClientSource, SecureDataSource, ServerSource};
use cloak_lib::transport::TcpTransport;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
    cloak keygen <pkcs8 path>
    cloak serve <addr> <file:<pkcs8 path>,<common name>> [protocol,...]
    cloak connect <addr> <target> <server public key hex> [protocol,...]";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["keygen", path] => keygen(path),
        ["serve", addr, cert, rest @ ..] => serve(addr, cert, protocols(rest)),
        ["connect", addr, target, key, rest @ ..] => connect(addr, target, key, protocols(rest)),
        _ => bail!("{USAGE}"),
    }
}

fn protocols(rest: &[&str]) -> Vec<String> {
    rest.first()
        .map(|list| list.split(',').filter(|name| !name.is_empty()).map(str::to_owned).collect())
        .unwrap_or_default()
}

fn keygen(path: &str) -> anyhow::Result<()> {
    let pkcs8 = generate_signing_key_pkcs8()?;
    std::fs::write(path, &pkcs8).with_context(|| format!("writing {path}"))?;
    println!("{}", hex::encode(signing_public_key(&pkcs8)?));
    Ok(())
}

fn serve(addr: &str, cert: &str, protocols: Vec<String>) -> anyhow::Result<()> {
    let certificate: CertificateRef = cert.parse()?;
    if certificate.source != CertSource::File {
        bail!("only file certificates can be served from the command line");
    }
    let listener = TcpListener::bind(addr).with_context(|| format!("binding {addr}"))?;
    info!(addr = %listener.local_addr()?, %certificate, "listening");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let config = ServerConfig::new(certificate.clone()).close_transport(true);
        let provider = RingProvider::new().with_protocols(protocols.clone());
        thread::spawn(move || {
            let peer = stream.peer_addr().ok();
            if let Err(err) = echo(stream, provider, config) {
                warn!(?peer, "session ended: {err:#}");
            }
        });
    }
    Ok(())
}

fn echo(stream: std::net::TcpStream, provider: RingProvider, config: ServerConfig) -> anyhow::Result<()> {
    let mut source = ServerSource::new(TcpTransport::new(stream)?, provider, config);
    source.setup()?;
    info!(protocol = ?source.negotiated_protocol(), "session established");

    let mut buf = [0u8; 4096];
    let result = loop {
        match source.get_data(&mut buf) {
            Ok(0) if source.channel().peer_closed() => break Ok(()),
            Ok(0) => continue,
            Ok(count) => {
                if let Err(err) = source.put_data(&buf[..count]) {
                    break Err(err);
                }
            }
            Err(err) => break Err(err),
        }
    };

    let report = source.terminate();
    if !report.is_clean() {
        warn!(errors = ?report.errors, "unclean shutdown");
    }
    Ok(result?)
}

fn connect(addr: &str, target: &str, key: &str, protocols: Vec<String>) -> anyhow::Result<()> {
    let public_key = hex::decode(key).context("server public key is not hex")?;
    let provider = RingProvider::new().trust(target, &public_key)?;
    let config = ClientConfig::new(target).protocols(protocols).close_transport(true);

    let transport = TcpTransport::connect(addr, CONNECT_TIMEOUT).with_context(|| format!("connecting to {addr}"))?;
    let mut source = ClientSource::new(transport, provider, config);
    source.setup()?;
    info!(protocol = ?source.negotiated_protocol(), "session established");

    let mut reply = Vec::new();
    for line in io::stdin().lock().lines() {
        let line = line? + "\n";
        source.write_all(line.as_bytes())?;

        reply.resize(line.len(), 0);
        source.read_exact(&mut reply)?;
        io::stdout().write_all(&reply)?;
    }

    let report = source.terminate();
    match report.errors.first() {
        Some(err) => Err(anyhow!("unclean shutdown: {err}")),
        None => Ok(()),
    }
}
