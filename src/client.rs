//! Control socket client
//!
//! Sends one request line and waits for the matching response line.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::protocol::{ProtocolError, Request, Response};

/// Send a request to the daemon and return its response
pub async fn call(socket: &Path, request: &Request) -> Result<Response, ClientError> {
    let mut session = Session::connect(socket).await?;
    session.call(request).await
}

/// A connection that can carry several request/response pairs
pub struct Session {
    reader: BufReader<UnixStream>,
}

impl Session {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub async fn connect(socket: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|source| ClientError::Connect {
                path: socket.display().to_string(),
                source,
            })?;
        Ok(Self::new(stream))
    }

    /// Send a request and wait for its response
    pub async fn call(&mut self, request: &Request) -> Result<Response, ClientError> {
        let line = request.to_line()?;
        let stream = self.reader.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;

        let mut response = String::new();
        let n = self.reader.read_line(&mut response).await?;
        if n == 0 {
            return Err(ClientError::Closed);
        }
        Ok(Response::parse(&response)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Daemon closed the connection")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Function;
    use tokio::net::UnixListener;

    fn socket_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("svcmgr-client-{}-{}.sock", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let path = socket_path("rt");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "{\"Function\":\"stop\",\"Service\":\"web\"}\n");
            reader
                .get_mut()
                .write_all(b"{\"Status\":\"error\",\"Error\":\"The Service is not active.\"}\n")
                .await
                .unwrap();
        });

        let response = tokio_test::assert_ok!(
            call(&path, &Request::new(Function::Stop, Some("web"))).await
        );
        assert!(!response.is_ok());
        assert_eq!(response.error.as_deref(), Some("The Service is not active."));

        server.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let path = socket_path("closed");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let err = tokio_test::assert_err!(call(&path, &Request::new(Function::List, None)).await);
        assert!(matches!(err, ClientError::Closed | ClientError::Io(_)));

        server.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let err = call(
            Path::new("/nonexistent/svcmgr.sock"),
            &Request::new(Function::List, None),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
