//! XMPP notification client.
//!
//! Each alert opens a short-lived client session: stream negotiation,
//! STARTTLS when configured, SASL PLAIN, resource binding, initial presence,
//! one chat message, stream close. Every server reply is bounded by a read
//! timeout so an unresponsive server fails the step instead of hanging it.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::XmppSettings;
use crate::dispatch::AlertStep;
use crate::{escape_xml, RoomBinding};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BUFFERED_BYTES: usize = 256 * 1024;
const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// `user@domain[/resource]` split into its parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Jid {
    pub local: String,
    pub domain: String,
}

impl Jid {
    pub fn parse(raw: &str) -> Result<Self> {
        let bare = raw.trim().split('/').next().unwrap_or_default();
        let (local, domain) = bare
            .split_once('@')
            .ok_or_else(|| anyhow!("jid '{}' must look like user@domain", raw))?;
        if local.is_empty() || domain.is_empty() {
            return Err(anyhow!("jid '{}' must look like user@domain", raw));
        }
        Ok(Self {
            local: local.to_string(),
            domain: domain.to_string(),
        })
    }
}

pub struct XmppNotifier {
    settings: XmppSettings,
}

impl XmppNotifier {
    pub fn new(settings: XmppSettings) -> Self {
        Self { settings }
    }

    /// Deliver `text` to the configured recipient.
    pub fn send(&self, text: &str) -> Result<()> {
        let jid = Jid::parse(&self.settings.jid)?;
        let host = self.settings.server.as_deref().unwrap_or(&jid.domain);
        let tcp = connect_tcp(host, self.settings.port)
            .with_context(|| format!("connect to XMPP server {}:{}", host, self.settings.port))?;

        let mut session = Session::new(XmppStream::Plain(tcp));
        let mut features = session.open_stream(&jid.domain)?;

        if self.settings.starttls {
            if !features.contains("<starttls") {
                return Err(anyhow!("XMPP server does not offer STARTTLS"));
            }
            session.send(&format!("<starttls xmlns='{}'/>", NS_TLS))?;
            let (name, _) = session.read_element(&["proceed", "failure"])?;
            if name == "failure" {
                return Err(anyhow!("XMPP server refused STARTTLS"));
            }
            session = session.upgrade_tls(&jid.domain)?;
            features = session.open_stream(&jid.domain)?;
        }

        self.authenticate(&mut session, &jid, &features)?;
        let features = session.open_stream(&jid.domain)?;

        if features.contains("<bind") {
            session.send(&format!(
                "<iq type='set' id='bind_1'><bind xmlns='{}'><resource>{}</resource></bind></iq>",
                NS_BIND,
                escape_xml(&self.settings.resource)
            ))?;
            expect_iq_result(&mut session, "resource bind")?;
        }
        if features.contains("<session") && !features.contains("<optional") {
            session.send(&format!(
                "<iq type='set' id='sess_1'><session xmlns='{}'/></iq>",
                NS_SESSION
            ))?;
            expect_iq_result(&mut session, "session")?;
        }

        session.send("<presence/>")?;
        session.send(&chat_message(&self.settings.recipient, text))?;
        session.close();
        log::info!("alert message sent to {}", self.settings.recipient);
        Ok(())
    }

    fn authenticate(&self, session: &mut Session, jid: &Jid, features: &str) -> Result<()> {
        if !features.contains(">PLAIN<") {
            return Err(anyhow!("XMPP server does not offer SASL PLAIN"));
        }
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("\0{}\0{}", jid.local, self.settings.password));
        session.send(&format!(
            "<auth xmlns='{}' mechanism='PLAIN'>{}</auth>",
            NS_SASL, token
        ))?;
        let (name, _) = session.read_element(&["success", "failure"])?;
        if name == "failure" {
            return Err(anyhow!("XMPP authentication failed for {}", self.settings.jid));
        }
        Ok(())
    }
}

fn expect_iq_result(session: &mut Session, what: &str) -> Result<()> {
    let (_, iq) = session.read_element(&["iq"])?;
    if iq.contains("type='error'") || iq.contains("type=\"error\"") {
        return Err(anyhow!("XMPP {} rejected: {}", what, iq));
    }
    Ok(())
}

/// Chat-typed message stanza for `to`.
pub fn chat_message(to: &str, body: &str) -> String {
    format!(
        "<message to='{}' type='chat'><body>{}</body></message>",
        escape_xml(to),
        escape_xml(body)
    )
}

fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_read_timeout(Some(READ_TIMEOUT))?;
                stream.set_write_timeout(Some(READ_TIMEOUT))?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => e.into(),
        None => anyhow!("no addresses for {}", host),
    })
}

// -------------------- Stream plumbing --------------------

enum XmppStream {
    Plain(TcpStream),
    #[cfg(feature = "xmpp-tls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for XmppStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            XmppStream::Plain(s) => s.read(buf),
            #[cfg(feature = "xmpp-tls")]
            XmppStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for XmppStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            XmppStream::Plain(s) => s.write(buf),
            #[cfg(feature = "xmpp-tls")]
            XmppStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            XmppStream::Plain(s) => s.flush(),
            #[cfg(feature = "xmpp-tls")]
            XmppStream::Tls(s) => s.flush(),
        }
    }
}

struct Session {
    stream: XmppStream,
    pending: String,
}

impl Session {
    fn new(stream: XmppStream) -> Self {
        Self {
            stream,
            pending: String::new(),
        }
    }

    fn send(&mut self, xml: &str) -> Result<()> {
        self.stream.write_all(xml.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Open (or restart) the stream and return the advertised features.
    fn open_stream(&mut self, domain: &str) -> Result<String> {
        self.pending.clear();
        self.send(&format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' \
             xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
            escape_xml(domain)
        ))?;
        let (_, features) = self.read_element(&["stream:features"])?;
        Ok(features)
    }

    /// Read until one of `names` is complete; return its name and text.
    fn read_element(&mut self, names: &[&str]) -> Result<(String, String)> {
        loop {
            if element_span(&self.pending, "stream:error").is_some() {
                return Err(anyhow!("XMPP stream error: {}", self.pending));
            }
            let found = names
                .iter()
                .filter_map(|name| element_span(&self.pending, name).map(|span| (*name, span)))
                .min_by_key(|(_, (start, _))| *start);
            if let Some((name, (start, end))) = found {
                let element = self.pending[start..end].to_string();
                self.pending.drain(..end);
                return Ok((name.to_string(), element));
            }
            self.fill()
                .with_context(|| format!("waiting for XMPP <{}>", names.join("|")))?;
        }
    }

    fn fill(&mut self) -> Result<()> {
        if self.pending.len() > MAX_BUFFERED_BYTES {
            return Err(anyhow!("XMPP server reply too large"));
        }
        let mut buf = [0u8; 4096];
        let n = self.stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("XMPP server closed the connection"));
        }
        self.pending.push_str(&String::from_utf8_lossy(&buf[..n]));
        Ok(())
    }

    #[cfg(feature = "xmpp-tls")]
    fn upgrade_tls(self, domain: &str) -> Result<Session> {
        use std::sync::Arc;

        let tcp = match self.stream {
            XmppStream::Plain(tcp) => tcp,
            XmppStream::Tls(_) => return Err(anyhow!("XMPP stream is already encrypted")),
        };
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = rustls::crypto::aws_lc_rs::default_provider();
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!("failed to configure TLS versions: {}", e))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = rustls::pki_types::ServerName::try_from(domain.to_string())
            .map_err(|e| anyhow!("invalid XMPP domain '{}': {}", domain, e))?;
        let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| anyhow!("failed to start TLS: {}", e))?;
        Ok(Session::new(XmppStream::Tls(Box::new(rustls::StreamOwned::new(
            conn, tcp,
        )))))
    }

    #[cfg(not(feature = "xmpp-tls"))]
    fn upgrade_tls(self, _domain: &str) -> Result<Session> {
        Err(anyhow!(
            "STARTTLS requires the 'xmpp-tls' feature; \
             set xmpp.starttls = false for a plaintext server"
        ))
    }

    fn close(mut self) {
        if let Err(e) = self.send("</stream:stream>") {
            log::debug!("XMPP stream close failed: {}", e);
            return;
        }
        // Wait briefly for the server's close so the message is not cut off.
        let _ = self.tcp().set_read_timeout(Some(Duration::from_secs(2)));
        while !self.pending.contains("</stream:stream>") {
            if self.fill().is_err() {
                break;
            }
        }
    }

    fn tcp(&self) -> &TcpStream {
        match &self.stream {
            XmppStream::Plain(tcp) => tcp,
            #[cfg(feature = "xmpp-tls")]
            XmppStream::Tls(tls) => &tls.sock,
        }
    }
}

/// Byte span of the first complete `<name ...>` element in `text`, either
/// self-closing or with its matching end tag.
fn element_span(text: &str, name: &str) -> Option<(usize, usize)> {
    let start = text.find(&format!("<{}", name))?;
    let tag_end = start + text[start..].find('>')?;
    if text[..tag_end].ends_with('/') {
        return Some((start, tag_end + 1));
    }
    let close = format!("</{}>", name);
    let close_at = tag_end + text[tag_end..].find(&close)?;
    Some((start, close_at + close.len()))
}

/// Alert step: message the configured recipient about the room.
pub struct MessageStep {
    notifier: XmppNotifier,
}

impl MessageStep {
    pub fn new(notifier: XmppNotifier) -> Self {
        Self { notifier }
    }
}

impl AlertStep for MessageStep {
    fn name(&self) -> &'static str {
        "message"
    }

    fn run(&self, binding: &RoomBinding) -> Result<()> {
        self.notifier.send(&binding.alert_text())
    }
}
