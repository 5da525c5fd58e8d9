//! XMPP over TLS to FCM.
//!
//! FCM speaks direct TLS (no STARTTLS), SASL PLAIN with the sender id and
//! server key, then the usual resource bind. After that the session only
//! carries `<message>` stanzas.

use crate::framing::{RawFrame, StanzaCodec};
use crate::transport::{Connector, FrameSink, FrameSource};
use crate::{ConfigError, HandshakeError, TransportError, XmppConfig};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use smsrelay_core::stanza::{parse_stanza, Element};
use smsrelay_core::ConnectionId;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};

const STREAM_HEADER: &str = concat!(
    "<stream:stream to=\"gcm.googleapis.com\" version=\"1.0\" ",
    "xmlns=\"jabber:client\" xmlns:stream=\"http://etherx.jabber.org/streams\">"
);
const BIND_ID: &str = "bind_1";
const SESSION_ID: &str = "session_1";

type Tls = TlsStream<TcpStream>;

/// Receiving half of an XMPP session.
pub struct XmppSource<R = ReadHalf<Tls>> {
    frames: FramedRead<R, StanzaCodec>,
}

/// Sending half of an XMPP session.
pub struct XmppSink<W = WriteHalf<Tls>> {
    frames: FramedWrite<W, StanzaCodec>,
}

#[async_trait]
impl<R> FrameSource for XmppSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.frames.next().await {
            None | Some(Ok(RawFrame::StreamClose)) => Ok(None),
            Some(Ok(RawFrame::Stanza(frame))) => Ok(Some(frame)),
            Some(Ok(RawFrame::StreamOpen(_))) => {
                Err(TransportError::Framing("unexpected stream restart".into()))
            }
            Some(Ok(RawFrame::Malformed(reason))) => Err(TransportError::Framing(reason)),
            Some(Err(err)) if is_disconnect(&err) => Ok(None),
            Some(Err(err)) => Err(err.into()),
        }
    }
}

#[async_trait]
impl<W> FrameSink for XmppSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.frames.send(frame).await.map_err(TransportError::from)
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Opens TLS sessions to FCM and authenticates them.
pub struct XmppConnector {
    config: XmppConfig,
    tls: TlsConnector,
}

impl XmppConnector {
    pub fn new(config: XmppConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ConfigError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            config,
            tls: TlsConnector::from(Arc::new(tls)),
        })
    }

    pub fn config(&self) -> &XmppConfig {
        &self.config
    }

    async fn establish(
        &self,
        id: ConnectionId,
    ) -> Result<(XmppSource, XmppSink), HandshakeError> {
        let host = self.config.host.clone();
        let port = self.config.port();
        tracing::debug!(connection = %id, host = %host, port, "connecting");

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;
        let server_name =
            ServerName::try_from(host.clone()).map_err(|_| HandshakeError::ServerName(host))?;
        let tls = self.tls.connect(server_name, tcp).await?;

        let (read, write) = tokio::io::split(tls);
        let mut source = XmppSource {
            frames: FramedRead::new(read, StanzaCodec),
        };
        let mut sink = XmppSink {
            frames: FramedWrite::new(write, StanzaCodec),
        };
        negotiate(&mut source, &mut sink, &self.config.login(), &self.config.server_key).await?;
        tracing::debug!(connection = %id, "xmpp session established");
        Ok((source, sink))
    }
}

#[async_trait]
impl Connector for XmppConnector {
    type Source = XmppSource;
    type Sink = XmppSink;

    async fn connect(&self, id: ConnectionId) -> Result<(XmppSource, XmppSink), HandshakeError> {
        let limit = self.config.handshake_timeout();
        tokio::time::timeout(limit, self.establish(id))
            .await
            .map_err(|_| HandshakeError::Timeout(limit))?
    }
}

/// Run stream open, SASL PLAIN, stream restart, bind and session.
pub(crate) async fn negotiate<R, W>(
    source: &mut XmppSource<R>,
    sink: &mut XmppSink<W>,
    login: &str,
    secret: &str,
) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let features = open_stream(source, sink).await?;
    let offers_plain = features.child("mechanisms").is_some_and(|mechanisms| {
        mechanisms
            .children_named("mechanism")
            .any(|m| m.text.trim() == "PLAIN")
    });
    if !offers_plain {
        return Err(HandshakeError::Unsupported("SASL PLAIN"));
    }

    sink.send(auth_stanza(login, secret)).await?;
    let reply = next_stanza(source).await?;
    match reply.local_name() {
        "success" => {}
        "failure" => {
            let condition = reply
                .children
                .first()
                .map(|c| c.local_name().to_string())
                .unwrap_or_else(|| "unknown".into());
            return Err(HandshakeError::AuthRejected(condition));
        }
        other => return Err(HandshakeError::Unexpected(format!("<{other}> after auth"))),
    }

    let features = open_stream(source, sink).await?;
    if features.child("bind").is_none() {
        return Err(HandshakeError::Unsupported("resource binding"));
    }
    let bind = format!(
        "<iq type=\"set\" id=\"{BIND_ID}\"><bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/></iq>"
    );
    request(source, sink, bind, BIND_ID).await?;

    if features.child("session").is_some() {
        let session = format!(
            "<iq type=\"set\" id=\"{SESSION_ID}\"><session xmlns=\"urn:ietf:params:xml:ns:xmpp-session\"/></iq>"
        );
        request(source, sink, session, SESSION_ID).await?;
    }
    Ok(())
}

fn auth_stanza(login: &str, secret: &str) -> Bytes {
    let credentials = STANDARD.encode(format!("\0{login}\0{secret}"));
    Bytes::from(format!(
        "<auth mechanism=\"PLAIN\" xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\">{credentials}</auth>"
    ))
}

/// Send a stream header and return the features that follow it.
async fn open_stream<R, W>(
    source: &mut XmppSource<R>,
    sink: &mut XmppSink<W>,
) -> Result<Element, HandshakeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    sink.send(Bytes::from_static(STREAM_HEADER.as_bytes())).await?;
    match source.frames.next().await {
        Some(Ok(RawFrame::StreamOpen(_))) => {}
        Some(Ok(other)) => return Err(HandshakeError::Unexpected(format!("{other:?}"))),
        Some(Err(err)) => return Err(err.into()),
        None => return Err(HandshakeError::StreamClosed),
    }
    let features = next_stanza(source).await?;
    if features.local_name() != "features" {
        return Err(HandshakeError::Unexpected(format!(
            "<{}> instead of stream features",
            features.name
        )));
    }
    Ok(features)
}

async fn request<R, W>(
    source: &mut XmppSource<R>,
    sink: &mut XmppSink<W>,
    iq: String,
    id: &str,
) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    sink.send(Bytes::from(iq)).await?;
    let reply = next_stanza(source).await?;
    if reply.local_name() == "iq" && reply.attr("id") == Some(id) && reply.attr("type") == Some("result") {
        Ok(())
    } else {
        Err(HandshakeError::Unexpected(format!(
            "<{} type={:?}> in reply to {id}",
            reply.name,
            reply.attr("type")
        )))
    }
}

async fn next_stanza<R>(source: &mut XmppSource<R>) -> Result<Element, HandshakeError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    match source.frames.next().await {
        Some(Ok(RawFrame::Stanza(frame))) => {
            parse_stanza(&frame).map_err(|e| HandshakeError::Unexpected(e.to_string()))
        }
        Some(Ok(RawFrame::StreamOpen(_))) => Err(HandshakeError::Unexpected("stream restart".into())),
        Some(Ok(RawFrame::Malformed(reason))) => Err(HandshakeError::Unexpected(reason)),
        Some(Ok(RawFrame::StreamClose)) | None => Err(HandshakeError::StreamClosed),
        Some(Err(err)) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const FEATURES_SASL: &str = "<stream:features><mechanisms xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"><mechanism>X-OAUTH2</mechanism><mechanism>PLAIN</mechanism></mechanisms></stream:features>";
    const FEATURES_BIND: &str = "<stream:features><bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/><session xmlns=\"urn:ietf:params:xml:ns:xmpp-session\"/></stream:features>";
    const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream from=\"gcm.googleapis.com\" id=\"s1\" version=\"1.0\" xmlns=\"jabber:client\" xmlns:stream=\"http://etherx.jabber.org/streams\">";

    fn client(stream: DuplexStream) -> (XmppSource<ReadHalf<DuplexStream>>, XmppSink<WriteHalf<DuplexStream>>) {
        let (read, write) = tokio::io::split(stream);
        (
            XmppSource {
                frames: FramedRead::new(read, StanzaCodec),
            },
            XmppSink {
                frames: FramedWrite::new(write, StanzaCodec),
            },
        )
    }

    /// Read from the client until `needle` shows up.
    async fn expect(server: &mut DuplexStream, seen: &mut String, needle: &str) {
        let mut buf = [0u8; 1024];
        while !seen.contains(needle) {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up while waiting for {needle}");
            seen.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        seen.clear();
    }

    #[tokio::test]
    async fn full_handshake() {
        let (client_io, mut server) = tokio::io::duplex(8192);
        let fake_fcm = tokio::spawn(async move {
            let mut seen = String::new();
            expect(&mut server, &mut seen, "<stream:stream").await;
            server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
            server.write_all(FEATURES_SASL.as_bytes()).await.unwrap();

            // base64("\0123@gcm.googleapis.com\0key")
            let expected = STANDARD.encode("\0123@gcm.googleapis.com\0key");
            expect(&mut server, &mut seen, &format!("{expected}</auth>")).await;
            server
                .write_all(b"<success xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"/>")
                .await
                .unwrap();

            expect(&mut server, &mut seen, "<stream:stream").await;
            server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
            server.write_all(FEATURES_BIND.as_bytes()).await.unwrap();

            expect(&mut server, &mut seen, "</iq>").await;
            server
                .write_all(b"<iq type=\"result\" id=\"bind_1\"><bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"><jid>123@gcm.googleapis.com/r</jid></bind></iq>")
                .await
                .unwrap();

            expect(&mut server, &mut seen, "</iq>").await;
            server
                .write_all(b"<iq type=\"result\" id=\"session_1\"/>")
                .await
                .unwrap();
            server
        });

        let (mut source, mut sink) = client(client_io);
        negotiate(&mut source, &mut sink, "123@gcm.googleapis.com", "key")
            .await
            .unwrap();

        let mut server = fake_fcm.await.unwrap();
        server
            .write_all(b" <message><gcm xmlns=\"google:mobile:data\">{}</gcm></message>")
            .await
            .unwrap();
        let frame = source.recv().await.unwrap().unwrap();
        assert!(frame.starts_with(b"<message>"));

        server.write_all(b"</stream:stream>").await.unwrap();
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejected_credentials() {
        let (client_io, mut server) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            let mut seen = String::new();
            expect(&mut server, &mut seen, "<stream:stream").await;
            server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
            server.write_all(FEATURES_SASL.as_bytes()).await.unwrap();
            expect(&mut server, &mut seen, "</auth>").await;
            server
                .write_all(b"<failure xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"><not-authorized/></failure>")
                .await
                .unwrap();
            // Keep the pipe open until the client is done.
            let _ = server.read(&mut [0u8; 16]).await;
        });

        let (mut source, mut sink) = client(client_io);
        let err = negotiate(&mut source, &mut sink, "1@gcm.googleapis.com", "bad")
            .await
            .unwrap_err();
        assert!(
            matches!(&err, HandshakeError::AuthRejected(reason) if reason == "not-authorized"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn missing_plain_mechanism() {
        let (client_io, mut server) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            let mut seen = String::new();
            expect(&mut server, &mut seen, "<stream:stream").await;
            server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
            server
                .write_all(b"<stream:features><mechanisms><mechanism>X-OAUTH2</mechanism></mechanisms></stream:features>")
                .await
                .unwrap();
            let _ = server.read(&mut [0u8; 16]).await;
        });

        let (mut source, mut sink) = client(client_io);
        let err = negotiate(&mut source, &mut sink, "1@gcm.googleapis.com", "k")
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Unsupported("SASL PLAIN")), "{err:?}");
    }

    #[tokio::test]
    async fn server_hangup_during_handshake() {
        let (client_io, server) = tokio::io::duplex(8192);
        drop(server);
        let (mut source, mut sink) = client(client_io);
        let err = negotiate(&mut source, &mut sink, "1@gcm.googleapis.com", "k")
            .await
            .unwrap_err();
        assert!(
            matches!(err, HandshakeError::StreamClosed | HandshakeError::Io(_)),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn hangup_after_session_is_end_of_stream() {
        let (client_io, server) = tokio::io::duplex(64);
        let (mut source, _sink) = client(client_io);
        drop(server);
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[test]
    fn connector_requires_credentials() {
        assert!(matches!(
            XmppConnector::new(XmppConfig::new("", "k")),
            Err(ConfigError::Missing("sender_id"))
        ));
    }
}
