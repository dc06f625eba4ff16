//! Health monitor for the engine, allowing external services to confirm it
//! is online. Returns an HTTP 200 response to any request on
//! `{hostname}:{port}/health`.

use anyhow::Context;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
};
use tracing::{info, warn};

use crate::settings;

pub struct HealthChecker {
	listener: TcpListener,
}

// Split into new and run so callers can ensure the TcpListener is active
// before proceeding in tests.
impl HealthChecker {
	pub async fn new(health_check_settings: &settings::HealthCheck) -> anyhow::Result<Self> {
		let bind_address =
			format!("{}:{}", health_check_settings.hostname, health_check_settings.port);

		info!("Starting health checker on {bind_address}");

		Ok(Self {
			listener: TcpListener::bind(&bind_address)
				.await
				.with_context(|| format!("Could not bind TCP listener to {bind_address}"))?,
		})
	}

	pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
		Ok(self.listener.local_addr()?)
	}

	pub async fn run(self) -> anyhow::Result<()> {
		loop {
			match self.listener.accept().await {
				Ok((mut stream, _address)) => {
					let mut buffer = [0; 1024];
					let read = stream
						.read(&mut buffer)
						.await
						.context("Couldn't read stream into buffer")?;

					let request_line = String::from_utf8_lossy(&buffer[..read]);
					let response = if request_line.starts_with("GET /health") {
						"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n"
					} else {
						"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n"
					};
					stream
						.write_all(response.as_bytes())
						.await
						.context("Could not write to health check stream")?;
					stream.flush().await.context("Could not flush health check stream")?;
				},
				Err(e) => {
					warn!("Could not open CONNECTION to health checker: {e}");
				},
			}
		}
	}
}
