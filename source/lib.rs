// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc4315 - [...] UIDPLUS extension
// https://www.rfc-editor.org/rfc/rfc4549 - Synchronization Operations for Disconnected IMAP4 Clients
// https://www.rfc-editor.org/rfc/rfc7162 - [...] Quick Mailbox Resynchronization (QRESYNC)

#![allow(clippy::upper_case_acronyms)]

use anyhow::Context as _;
use std::{
  net::{self, ToSocketAddrs as _},
  num, path,
  sync::Arc,
  thread, time,
};
use zeroize::Zeroize as _;

pub mod crypto;
pub mod dirmgr;
pub mod dn;
pub mod error;
pub mod fetcher;
pub mod log;
pub mod maildir;
pub mod mailbox;
pub mod model;
pub mod render;
pub mod server;
pub mod services;
pub mod sfpair;
pub mod up;
pub mod wire;

use services::Services;

fn parse_duration(argument: &str) -> Result<time::Duration, num::ParseIntError> {
  Ok(time::Duration::from_secs(argument.parse()?))
}

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(long = "bind-address", help = "Downward bind address", default_value_t = String::from("127.0.0.1"))]
  pub bind_address: String,
  #[arg(long = "bind-port", help = "Downward bind port")]
  pub bind_port: u16,
  #[arg(long = "cert", help = "Downward TLS certificate chain (PEM)")]
  pub cert: path::PathBuf,
  #[arg(long = "key", help = "Downward TLS private key (PEM)")]
  pub key: path::PathBuf,

  #[arg(long = "address", help = "Upstream server address")]
  pub address: String,
  #[arg(long = "port", help = "Upstream server port")]
  pub port: u16,
  #[arg(long = "tls", help = "Enable upstream TLS", default_value_t = true)]
  pub tls: bool,
  #[arg(long = "timeout", help = "Upstream TCP timeout (in seconds)", value_parser = parse_duration)]
  pub timeout: Option<time::Duration>,
  #[arg(
    long = "threads",
    help = "Number of worker threads to spawn",
    default_value_t = num::NonZeroUsize::new(8).unwrap()
  )]
  pub threads: num::NonZeroUsize,

  #[arg(long = "cache", help = "Mailbox cache root directory")]
  pub cache: path::PathBuf,
  #[arg(long = "keypair", help = "Decryption keypair (PEM)")]
  pub keypair: path::PathBuf,
  #[arg(long = "peer-keys", help = "Directory of recipients' public keys (PEM)")]
  pub peer_keys: Option<path::PathBuf>,
}

struct TCP<'a> {
  address: &'a str,
  port: u16,
  timeout: Option<time::Duration>,
}

impl TCP<'_> {
  fn open(&self) -> anyhow::Result<net::TcpStream> {
    let &Self { address, port, timeout } = self;
    let address = (address, port)
      .to_socket_addrs()?
      .next()
      .with_context(|| format!("couldn't resolve {address}:{port}"))?;
    ::log::debug!("connecting to {:?} with timeout {:?}", address, timeout);
    Ok(match timeout {
      Some(duration) => {
        let stream = net::TcpStream::connect_timeout(&address, duration)?;
        stream.set_read_timeout(Some(duration))?;
        stream
      }
      None => net::TcpStream::connect(address)?,
    })
  }
}

struct TLS<'a>(TCP<'a>);

#[ouroboros::self_referencing]
struct TLSStream {
  tcp_stream: net::TcpStream,
  tls_connection: rustls::ClientConnection,
  #[borrows(mut tcp_stream, mut tls_connection)]
  #[covariant]
  tls_stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl wire::ReadWrite for TLSStream {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::io::Read as _;
    self.with_mut(|fields| fields.tls_stream.read(buf))
  }

  fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    use std::io::Write as _;
    self.with_mut(|fields| fields.tls_stream.write_all(buf))
  }
}

impl TLS<'_> {
  fn open(&self) -> anyhow::Result<TLSStream> {
    let mut root_store = rustls::RootCertStore::empty();
    for certificate in rustls_native_certs::load_native_certs()? {
      root_store.add(&rustls::Certificate(certificate.0))?
    }
    Ok(
      TLSStreamBuilder {
        tcp_stream: self.0.open()?,
        tls_connection: rustls::ClientConnection::new(
          Arc::new(
            rustls::ClientConfig::builder()
              .with_safe_defaults()
              .with_root_certificates(root_store)
              .with_no_client_auth(),
          ),
          self
            .0
            .address
            .try_into()
            .with_context(|| format!("couldn't convert {} to server name", self.0.address))?,
        )?,
        tls_stream_builder: |tcp_stream, tls_connection| rustls::Stream::new(tls_connection, tcp_stream),
      }
      .build(),
    )
  }
}

/// Downward TLS (this proxy as a server): terminates the local client's TLS handshake using the
/// configured certificate/key pair.
#[ouroboros::self_referencing]
struct DownwardTLSStream {
  tcp_stream: net::TcpStream,
  tls_connection: rustls::ServerConnection,
  #[borrows(mut tcp_stream, mut tls_connection)]
  #[covariant]
  tls_stream: rustls::Stream<'this, rustls::ServerConnection, net::TcpStream>,
}

impl wire::ReadWrite for DownwardTLSStream {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::io::Read as _;
    self.with_mut(|fields| fields.tls_stream.read(buf))
  }

  fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    use std::io::Write as _;
    self.with_mut(|fields| fields.tls_stream.write_all(buf))
  }
}

fn downward_tls_config(cert_path: &path::Path, key_path: &path::Path) -> anyhow::Result<Arc<rustls::ServerConfig>> {
  let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(cert_path)?))?
    .into_iter()
    .map(rustls::Certificate)
    .collect();
  let mut keys = rustls_pemfile::pkcs8_private_keys(&mut std::io::BufReader::new(std::fs::File::open(key_path)?))?;
  let key = rustls::PrivateKey(keys.pop().context("no private key found in key file")?);
  Ok(Arc::new(
    rustls::ServerConfig::builder()
      .with_safe_defaults()
      .with_no_client_auth()
      .with_single_cert(certs, key)?,
  ))
}

fn open_upstream(arguments: &Arguments) -> anyhow::Result<wire::Stream<Box<dyn wire::ReadWrite>>> {
  let tcp = TCP {
    address: &arguments.address,
    port: arguments.port,
    timeout: arguments.timeout,
  };
  if !arguments.tls {
    ::log::warn!("upstream TLS not enabled, credentials will be sent in clear over the wire");
    return Ok(wire::Stream::new(Box::new(tcp.open()?)));
  }
  Ok(wire::Stream::new(Box::new(TLS(tcp).open()?)))
}

/// Each downward client supplies its own upstream credentials via LOGIN; citm never holds a
/// shared service account, it only relays what the client typed.
fn login_password(body: &imap_types::command::CommandBody<'_>) -> Option<String> {
  match body {
    imap_types::command::CommandBody::Login { password, .. } => {
      Some(String::from_utf8_lossy(password.as_ref()).into_owned())
    }
    _ => None,
  }
}

fn handle_connection(
  downward: Box<dyn wire::ReadWrite>,
  services: Arc<Services>,
  arguments_upstream: Arc<Arguments>,
) -> anyhow::Result<()> {
  let mut downward_stream = wire::Stream::new(downward);
  let upstream = open_upstream(&arguments_upstream)?;
  let fetcher = fetcher::Fetcher::new(upstream);
  let mut pair = sfpair::SfPair::new(fetcher, services.dirmgr.clone(), services.keypair.clone());
  pair.handshake()?;
  downward_stream.write_response(&pair.server().greeting())?;
  loop {
    let command = match downward_stream.read_command() {
      Ok(command) => command,
      Err(e) if e.kind() == error::Kind::Break => return Ok(()),
      Err(e) => return Err(e.into()),
    };
    let tag = command.tag.clone();
    let is_logout = matches!(command.body, imap_types::command::CommandBody::Logout);
    if matches!(command.body, imap_types::command::CommandBody::Idle) {
      handle_idle(&mut pair, &mut downward_stream, tag)?;
      continue;
    }
    let mut password = login_password(&command.body);
    let result = pair.handle(&command, password.as_deref());
    if let Some(password) = &mut password {
      password.zeroize();
    }
    match result {
      Ok(responses) => {
        for response in responses {
          downward_stream.write_response(&response)?;
        }
        downward_stream.write_response(&sfpair::tagged_ok(tag, "done")?)?;
      }
      Err(e) => {
        downward_stream.write_response(&sfpair::tagged_error(tag, &e)?)?;
      }
    }
    for unsolicited in pair.tick()? {
      emit_unsolicited(&mut downward_stream, unsolicited)?;
    }
    if is_logout {
      return Ok(());
    }
  }
}

/// IDLE doesn't round-trip through SfPair::handle like other commands: it blocks on a raw DONE
/// line instead of a parsed Command, so the continuation/drain dance lives here instead.
fn handle_idle(
  pair: &mut sfpair::SfPair,
  stream: &mut wire::Stream<Box<dyn wire::ReadWrite>>,
  tag: imap_types::core::Tag<'static>,
) -> anyhow::Result<()> {
  for unsolicited in pair.tick()? {
    emit_unsolicited(stream, unsolicited)?;
  }
  stream.write_response(&imap_types::response::Response::Continue(
    imap_types::response::Continue::basic(None, "ok twiddling my thumbs now").map_err(|e| anyhow::anyhow!("{e:?}"))?,
  ))?;
  loop {
    let line = stream.read_raw_line()?;
    if line.trim().eq_ignore_ascii_case("DONE") {
      break;
    }
  }
  for unsolicited in pair.tick()? {
    emit_unsolicited(stream, unsolicited)?;
  }
  stream.write_response(&sfpair::tagged_ok(tag, "done")?)?;
  Ok(())
}

fn emit_unsolicited(stream: &mut wire::Stream<Box<dyn wire::ReadWrite>>, update: dn::Unsolicited) -> anyhow::Result<()> {
  use imap_types::{
    fetch::MessageDataItem,
    response::{Data, Response},
  };
  let response = match update {
    dn::Unsolicited::Exists(count) => Response::Data(Data::Exists(count)),
    dn::Unsolicited::Expunge(seq) => Response::Data(Data::Expunge(
      seq.try_into().context("sequence number out of range")?,
    )),
    dn::Unsolicited::Fetch(seq, _uid, flags) => {
      let seq = seq.try_into().context("sequence number out of range")?;
      let items: Vec<MessageDataItem> = vec![render::flags_item(flags)];
      let items = items.try_into().context("FETCH produced no items")?;
      Response::Data(Data::Fetch { seq, items })
    }
  };
  stream.write_response(&response)?;
  Ok(())
}

pub fn run(arguments: Arguments) -> anyhow::Result<()> {
  let dirmgr = dirmgr::DirMgr::new(maildir::Builder::new(&arguments.cache)?);
  let keypair = crypto::Keypair::load(&arguments.keypair)?;
  let services = Services::new(
    dirmgr,
    keypair,
    arguments.address.clone(),
    arguments.port,
    arguments.tls,
    arguments.timeout,
  );

  if let Some(peer_keys) = arguments.peer_keys.clone() {
    services.refresh_recipient_keys(&peer_keys)?;
    let services = services.clone();
    thread::spawn(move || loop {
      thread::sleep(time::Duration::from_secs(300));
      if let Err(e) = services.refresh_recipient_keys(&peer_keys) {
        ::log::warn!("couldn't refresh peer keys: {e:#}");
      }
    });
  }

  let tls_config = downward_tls_config(&arguments.cert, &arguments.key)?;
  let listener = net::TcpListener::bind((arguments.bind_address.as_str(), arguments.bind_port))?;
  ::log::info!("listening on {}:{}", arguments.bind_address, arguments.bind_port);

  let connections = Arc::new(Semaphore::new(arguments.threads.get()));
  let arguments = Arc::new(arguments);
  for stream in listener.incoming() {
    let stream = stream?;
    let services = services.clone();
    let arguments = arguments.clone();
    let tls_config = tls_config.clone();
    let permit = connections.clone().acquire();
    thread::spawn(move || {
      let _permit = permit;
      let downward: Box<dyn wire::ReadWrite> = Box::new(
        DownwardTLSStreamBuilder {
          tcp_stream: stream,
          tls_connection: rustls::ServerConnection::new(tls_config).expect("valid TLS server config"),
          tls_stream_builder: |tcp_stream, tls_connection| rustls::Stream::new(tls_connection, tcp_stream),
        }
        .build(),
      );
      if let Err(e) = handle_connection(downward, services, arguments) {
        ::log::error!("connection ended: {e:#}");
      }
    });
  }
  Ok(())
}

/// Caps the number of downward connections handled concurrently at `--threads`, the way the
/// teacher's worker pool bounded concurrent sync jobs; each connection still gets its own OS
/// thread; this only blocks new accepts once the cap is hit.
struct Semaphore {
  state: std::sync::Mutex<usize>,
  condvar: std::sync::Condvar,
}

impl Semaphore {
  fn new(permits: usize) -> Self {
    Self {
      state: std::sync::Mutex::new(permits),
      condvar: std::sync::Condvar::new(),
    }
  }

  fn acquire(self: Arc<Self>) -> Permit {
    let mut permits = self.state.lock().unwrap();
    while *permits == 0 {
      permits = self.condvar.wait(permits).unwrap();
    }
    *permits -= 1;
    drop(permits);
    Permit(self)
  }
}

struct Permit(Arc<Semaphore>);

impl Drop for Permit {
  fn drop(&mut self) {
    *self.0.state.lock().unwrap() += 1;
    self.0.condvar.notify_one();
  }
}
