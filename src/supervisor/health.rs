use std::time::Duration;

use tracing::debug;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// A liveness probe against the running daemon's own interface
pub trait HealthProbe: Send + Sync {
    /// `Ok(())` when healthy, otherwise a short human-readable reason
    fn check(&self) -> std::result::Result<(), String>;
}

/// HTTP GET probe. Any non-2xx status or transport error is unhealthy.
pub struct HttpHealthProbe {
    url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: HEALTH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl HealthProbe for HttpHealthProbe {
    fn check(&self) -> std::result::Result<(), String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;

        let resp = client
            .get(&self.url)
            .send()
            .map_err(|e| format!("request failed: {}", e))?;

        let status = resp.status();
        debug!(url = %self.url, %status, "health probe");
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("received non-2xx status code: {}", status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve exactly one HTTP response on an ephemeral port
    fn one_shot_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                    status_line
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}/health", addr)
    }

    #[test]
    fn test_2xx_is_healthy() {
        let url = one_shot_server("200 OK");
        assert!(HttpHealthProbe::new(url).check().is_ok());
    }

    #[test]
    fn test_non_2xx_is_unhealthy() {
        let url = one_shot_server("503 Service Unavailable");
        let err = HttpHealthProbe::new(url).check().unwrap_err();
        assert!(err.contains("503"), "unexpected reason: {}", err);
    }

    #[test]
    fn test_connection_refused_is_unhealthy() {
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let probe = HttpHealthProbe::new(format!("http://127.0.0.1:{}/health", port))
            .with_timeout(Duration::from_millis(500));
        assert!(probe.check().is_err());
    }
}
