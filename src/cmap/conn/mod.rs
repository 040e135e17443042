mod command;
pub(crate) mod wire;

use derive_where::derive_where;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) use self::command::{Command, CommandResponse};
use self::wire::{next_request_id, BufferPool, Header, Message, DEFAULT_MAX_MESSAGE_SIZE};
use crate::{
    client::csfle::{AutoEncrypter, MIN_AUTO_ENCRYPTION_WIRE_VERSION},
    error::{ErrorKind, Result, RETRYABLE_WRITE_ERROR},
    namespace::Namespace,
    options::ServerAddress,
};

/// The size of the chunks read off the stream while reassembling a message.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// The subset of the handshake a connection's behavior depends on.
#[derive(Clone, Debug)]
pub(crate) struct StreamDescription {
    /// The address of the server this connection is to.
    pub(crate) server_address: ServerAddress,

    /// The maximum wire version the server understands.
    pub(crate) max_wire_version: i32,
}

/// The byte stream a connection communicates over. Establishment (TCP, TLS,
/// handshake) happens outside this crate; anything that reads and writes
/// works here.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A single established connection to a server.
#[derive_where(Debug)]
pub(crate) struct Connection {
    /// The driver-generated id for this connection.
    pub(crate) id: u32,

    /// The pool generation this connection belongs to. Connections from a
    /// cleared generation are discarded rather than reused.
    pub(crate) generation: u32,

    stream_description: StreamDescription,

    read_buffer: BufferPool,

    #[derive_where(skip)]
    stream: Box<dyn Stream>,
}

impl Connection {
    pub(crate) fn new(
        id: u32,
        generation: u32,
        stream_description: StreamDescription,
        stream: impl Stream + 'static,
    ) -> Self {
        Self {
            id,
            generation,
            stream_description,
            read_buffer: BufferPool::new(),
            stream: Box::new(stream),
        }
    }

    pub(crate) fn stream_description(&self) -> &StreamDescription {
        &self.stream_description
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.stream_description.server_address
    }

    /// Sends a command and returns the server's response body, applying the
    /// auto-encryption contract when an encrypter is configured: the command
    /// is encrypted before it leaves the process and the response decrypted
    /// before the caller sees it.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        encrypter: Option<&AutoEncrypter>,
    ) -> Result<bson::Document> {
        let retryable_write = command.retryable_write;
        let max_wire_version = self.stream_description.max_wire_version;
        tracing::debug!(
            command = command.name.as_str(),
            db = command.target_db.as_str(),
            address = %self.address(),
            connection_id = self.id,
            "sending command"
        );

        let body = match encrypter {
            Some(encrypter) if !encrypter.bypass_auto_encryption() => {
                if max_wire_version < MIN_AUTO_ENCRYPTION_WIRE_VERSION {
                    return Err(ErrorKind::IncompatibleServer {
                        message: format!(
                            "auto-encryption requires a server with wire version {} or newer, but \
                             {} reports wire version {}",
                            MIN_AUTO_ENCRYPTION_WIRE_VERSION,
                            self.stream_description.server_address,
                            max_wire_version,
                        ),
                    }
                    .into());
                }
                let namespace = Namespace::new(command.target_db.clone(), "$cmd");
                encrypter.encrypt(&namespace, &command.body).await?
            }
            _ => command.body.clone(),
        };

        let message = Message::from_command_body(&command, body, next_request_id());
        let result = self.round_trip(message).await;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let err = if retryable_write
                    && err.should_add_retryable_write_label(max_wire_version)
                    && !err.contains_label(RETRYABLE_WRITE_ERROR)
                {
                    err.with_label(RETRYABLE_WRITE_ERROR)
                } else {
                    err
                };
                return Err(err);
            }
        };

        let mut body = response.document_payload;
        if let Some(encrypter) = encrypter {
            body = encrypter.decrypt(body).await?;
        }

        CommandResponse::new(self.stream_description.server_address.clone(), body).into_result()
    }

    async fn round_trip(&mut self, message: Message) -> Result<Message> {
        let request_id = message.request_id;
        self.write_message(&message).await?;
        let response = self.read_message().await?;
        if response.response_to != request_id {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "expected a response to request {} but got one to {}",
                    request_id, response.response_to
                ),
            }
            .into());
        }
        Ok(response)
    }

    pub(crate) async fn write_message(&mut self, message: &Message) -> Result<()> {
        let frame = message.to_frame()?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one wire message, reassembling the length-prefixed frame from
    /// however the stream happens to chunk its bytes.
    pub(crate) async fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(length) = self.read_buffer.peek_length_prefix() {
                if length < (Header::LENGTH + 4) as i32 || length > DEFAULT_MAX_MESSAGE_SIZE {
                    return Err(ErrorKind::InvalidResponse {
                        message: format!("invalid message length {}", length),
                    }
                    .into());
                }
                if self.read_buffer.len() >= length as usize {
                    let frame = self.read_buffer.read(length)?;
                    return Message::from_frame(&frame);
                }
            }

            let mut chunk = vec![0; READ_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(ErrorKind::from(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-message",
                ))
                .into());
            }
            chunk.truncate(read);
            self.read_buffer.append(chunk);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub(crate) fn test_stream_description() -> StreamDescription {
        StreamDescription {
            server_address: ServerAddress::default(),
            max_wire_version: 17,
        }
    }

    /// A connection over a dangling in-memory stream, for tests that only
    /// care about pool bookkeeping.
    pub(crate) fn sink_connection(id: u32, generation: u32) -> Connection {
        let (local, _remote) = tokio::io::duplex(16);
        Connection::new(id, generation, test_stream_description(), local)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bson::doc;

    use super::{tests_support::test_stream_description, *};
    use crate::{
        client::csfle::test_support::MarkingCryptProvider,
        options::AutoEncryptionOptions,
        CryptProvider,
    };

    fn test_encrypter() -> AutoEncrypter {
        AutoEncrypter::new(
            AutoEncryptionOptions::builder()
                .provider(Arc::new(MarkingCryptProvider) as Arc<dyn CryptProvider>)
                .build(),
        )
        .unwrap()
    }

    /// Writes a message to one end of an in-memory pipe in deliberately
    /// awkward slices and reads it back through the framing layer.
    #[tokio::test]
    async fn message_reassembly_across_chunk_boundaries() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut conn = Connection::new(1, 0, test_stream_description(), local);

        let message = Message::new(
            doc! { "ping": 1, "payload": "x".repeat(64) },
            next_request_id(),
        );
        let frame = message.to_frame().unwrap();

        let writer = async move {
            // Dribble the frame out: 3-byte slices split the length prefix
            // itself across reads.
            for chunk in frame.chunks(3) {
                remote.write_all(chunk).await.unwrap();
                remote.flush().await.unwrap();
            }
            remote
        };

        let (read, _remote) = tokio::join!(conn.read_message(), writer);
        let read = read.unwrap();
        assert_eq!(read.document_payload, message.document_payload);
        assert_eq!(read.request_id, message.request_id);
        assert_eq!(conn.stream_description().max_wire_version, 17);
    }

    #[tokio::test]
    async fn eof_mid_message_is_a_network_error() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut conn = Connection::new(1, 0, test_stream_description(), local);

        let message = Message::new(doc! { "ping": 1 }, next_request_id());
        let frame = message.to_frame().unwrap();
        remote.write_all(&frame[..frame.len() / 2]).await.unwrap();
        drop(remote);

        let err = conn.read_message().await.unwrap_err();
        assert!(err.is_network_error());
    }

    #[tokio::test]
    async fn server_error_response_carries_code_and_labels() {
        let (local, remote) = tokio::io::duplex(4096);
        let mut conn = Connection::new(1, 0, test_stream_description(), local);
        let mut server_conn = Connection::new(2, 0, test_stream_description(), remote);

        let exchange = async move {
            let request = server_conn.read_message().await.unwrap();
            let reply = Message::reply_to(
                &request,
                doc! {
                    "ok": 0,
                    "code": 11600,
                    "codeName": "InterruptedAtShutdown",
                    "errmsg": "interrupted at shutdown",
                    "errorLabels": ["RetryableWriteError"],
                },
            );
            server_conn.write_message(&reply).await.unwrap();
        };

        let command = Command::new("insert", "app", doc! { "insert": "events" });
        let (result, _) = tokio::join!(conn.send_command(command, None), exchange);
        let err = result.unwrap_err();
        assert_eq!(err.code(), Some(11600));
        assert!(err.is_write_retryable());
    }

    #[tokio::test]
    async fn commands_are_encrypted_on_the_wire_and_decrypted_off_it() {
        let (local, remote) = tokio::io::duplex(4096);
        let mut conn = Connection::new(1, 0, test_stream_description(), local);
        let mut server_conn = Connection::new(2, 0, test_stream_description(), remote);

        let exchange = async move {
            let request = server_conn.read_message().await.unwrap();
            // The engine rewrote the query fields before they hit the wire,
            // but the caller's sort specification crossed unchanged.
            assert_eq!(
                request.document_payload.get_str("find").unwrap(),
                "enc(\"events\")"
            );
            assert_eq!(
                request.document_payload.get_document("sort").unwrap(),
                &doc! { "timestamp": -1 }
            );
            let reply = Message::reply_to(&request, doc! { "ok": 1, "cursor": "opaque" });
            server_conn.write_message(&reply).await.unwrap();
        };

        let command = Command::new(
            "find",
            "app",
            doc! { "find": "events", "sort": { "timestamp": -1 } },
        );
        let encrypter = test_encrypter();
        let (result, _) = tokio::join!(conn.send_command(command, Some(&encrypter)), exchange);
        let body = result.unwrap();
        assert_eq!(body.get_bool("decrypted").unwrap(), true);
    }

    #[tokio::test]
    async fn auto_encryption_requires_a_minimum_wire_version() {
        let (local, _remote) = tokio::io::duplex(16);
        let description = StreamDescription {
            server_address: ServerAddress::default(),
            max_wire_version: MIN_AUTO_ENCRYPTION_WIRE_VERSION - 1,
        };
        let mut conn = Connection::new(1, 0, description, local);

        let command = Command::new("insert", "app", doc! { "insert": "events" });
        let encrypter = test_encrypter();
        // Fails before any bytes are sent; no server is listening here.
        let err = conn
            .send_command(command, Some(&encrypter))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::IncompatibleServer { .. }
        ));
    }
}
