use std::time::Duration;

use crate::config::Config;

/// Various timeouts for the HTTP transports.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download, `None` for unbounded streaming.
    pub max_download: Option<Duration>,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: Some(config.max_download_timeout),
        }
    }

    /// Timeouts for long lived streaming downloads, which only bound the connection phase.
    pub fn streaming(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: None,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            max_download: Some(Duration::from_secs(315)),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// Idle connections are kept in the pool for 30 seconds so that the `getFile` call and the
/// following download reuse one connection.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Client {
    let mut builder = reqwest::ClientBuilder::new()
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(concat!("telecache/", env!("CARGO_PKG_VERSION")));

    if let Some(timeout) = timeouts.max_download {
        builder = builder.timeout(timeout);
    }

    builder.build().unwrap_or_else(|error| {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "Failed to build configured HTTP client, using defaults"
        );
        reqwest::Client::new()
    })
}
