use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
  #[error("failed to bind {addr}: {source}")]
  Bind {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },

  #[error("server error: {0}")]
  Serve(#[source] std::io::Error),
}
