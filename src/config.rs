//! Session configuration.

use std::time::Duration;

use crate::{extension::ExtensionConfig, CompressionLevel};

/// Default cap on a single frame payload: 1 MiB.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Default cap on a reassembled message: 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default cap on unparsed inbound bytes held while delivery is paused.
pub const MAX_RECV_BUFFER: usize = 2 * 1024 * 1024;

/// Configuration for a WebSocket session.
///
/// `SessionConfig` governs payload limits, control-frame delivery policy,
/// UTF-8 validation and compression. All fields have conservative defaults;
/// the `with_*` builders adjust individual settings.
///
/// # Example
/// ```rust
/// use wscore::{SessionConfig, DeflateConfig};
///
/// let config = SessionConfig::default()
///     .with_max_frame_payload(64 * 1024)
///     .with_utf8()
///     .with_compression(DeflateConfig::default());
/// ```
#[derive(Clone, Default)]
pub struct SessionConfig {
    /// Maximum allowed payload size for a single incoming frame, in bytes.
    ///
    /// A frame exceeding this size is a fatal error; the session closes with
    /// status 1009.
    ///
    /// Default: 1 MiB ([`MAX_FRAME_PAYLOAD`]).
    pub max_frame_payload: Option<usize>,

    /// Maximum size of a reassembled fragmented message, in bytes.
    ///
    /// Fragments accumulate until the final frame arrives; once the total
    /// exceeds this limit the session closes with status 1009.
    ///
    /// Default: 2 MiB ([`MAX_MESSAGE_SIZE`]), or twice `max_frame_payload`
    /// when that is set.
    pub max_message_size: Option<usize>,

    /// Maximum number of unparsed inbound bytes buffered while frame
    /// delivery is paused by flow control.
    ///
    /// A well-behaved embedder stops feeding bytes while
    /// [`CoreSession::is_paused`](crate::session::CoreSession::is_paused)
    /// reports `true`; this cap bounds memory if it does not.
    ///
    /// Default: 2 MiB ([`MAX_RECV_BUFFER`]).
    pub max_recv_buffer: Option<usize>,

    /// Whether incoming PING frames are delivered to the frame handler.
    ///
    /// The automatic PONG response is sent in either case; this flag only
    /// controls whether the handler observes the PING as well.
    ///
    /// Default: `false`.
    pub deliver_ping: bool,

    /// Whether completed TEXT messages are validated as UTF-8.
    ///
    /// Default: `false`.
    pub check_utf8: bool,

    /// How long the embedder should wait for the peer's close reply before
    /// calling [`CoreSession::on_close_timeout`](crate::session::CoreSession::on_close_timeout).
    ///
    /// The engine keeps no clock; this value is advisory for whoever drives
    /// the timers.
    ///
    /// Default: 10 seconds.
    pub close_timeout: Option<Duration>,

    /// Compression settings. `None` disables permessage-deflate.
    pub compression: Option<DeflateConfig>,
}

impl SessionConfig {
    /// Sets the maximum allowed payload size for a single incoming frame.
    pub fn with_max_frame_payload(self, size: usize) -> Self {
        Self {
            max_frame_payload: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of a reassembled fragmented message.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    /// Sets the cap on buffered unparsed inbound bytes.
    pub fn with_max_recv_buffer(self, size: usize) -> Self {
        Self {
            max_recv_buffer: Some(size),
            ..self
        }
    }

    /// Delivers incoming PING frames to the handler in addition to the
    /// automatic PONG.
    pub fn with_ping_delivery(self) -> Self {
        Self {
            deliver_ping: true,
            ..self
        }
    }

    /// Enables UTF-8 validation of completed TEXT messages.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Sets the advisory close-handshake timeout.
    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: Some(timeout),
            ..self
        }
    }

    /// Enables permessage-deflate with the given settings.
    pub fn with_compression(self, compression: DeflateConfig) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the compression level, enabling compression if it was off.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.level = level;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables compression.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Effective per-frame payload cap.
    pub fn max_frame_payload(&self) -> usize {
        self.max_frame_payload.unwrap_or(MAX_FRAME_PAYLOAD)
    }

    /// Effective reassembled-message cap.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size.unwrap_or_else(|| {
            self.max_frame_payload
                .map(|size| size.saturating_mul(2))
                .unwrap_or(MAX_MESSAGE_SIZE)
        })
    }

    /// Effective inbound buffer cap.
    pub fn max_recv_buffer(&self) -> usize {
        self.max_recv_buffer.unwrap_or(MAX_RECV_BUFFER)
    }

    /// Effective close-handshake timeout.
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout.unwrap_or(Duration::from_secs(10))
    }
}

/// Settings for permessage-deflate (RFC 7692).
///
/// # Compression Level
/// `level` trades compression ratio against CPU: 0 disables compression of
/// the stream content, 1-3 are fast, 9 compresses hardest.
///
/// # Context Takeover
/// By default the LZ77 window carries over between messages, improving the
/// ratio for related payloads at the cost of per-connection memory. The
/// `*_no_context_takeover` flags reset the window at every message boundary
/// for the respective direction.
#[derive(Clone, Default)]
pub struct DeflateConfig {
    /// Compression level (0-9) applied to outbound messages.
    pub level: CompressionLevel,

    /// Resets the server-to-client compression context after each message.
    pub server_no_context_takeover: bool,

    /// Resets the client-to-server compression context after each message.
    pub client_no_context_takeover: bool,
}

impl DeflateConfig {
    /// Merges the peer's negotiated parameters into this configuration.
    ///
    /// A `no_context_takeover` flag is in effect when either side requested
    /// it, so the result ORs the peer's offer into the local settings. The
    /// compression level is local-only and passes through.
    pub fn merge(&self, negotiated: &ExtensionConfig) -> Self {
        Self {
            level: self.level,
            server_no_context_takeover: self.server_no_context_takeover
                || negotiated.has_param("server_no_context_takeover"),
            client_no_context_takeover: self.client_no_context_takeover
                || negotiated.has_param("client_no_context_takeover"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = SessionConfig::default();
        assert_eq!(config.max_frame_payload(), MAX_FRAME_PAYLOAD);
        assert_eq!(config.max_message_size(), MAX_MESSAGE_SIZE);
        assert_eq!(config.max_recv_buffer(), MAX_RECV_BUFFER);
        assert!(!config.deliver_ping);
        assert!(!config.check_utf8);
        assert!(config.compression.is_none());
    }

    #[test]
    fn test_message_size_follows_frame_payload() {
        let config = SessionConfig::default().with_max_frame_payload(64 * 1024);
        assert_eq!(config.max_message_size(), 128 * 1024);

        let config = config.with_max_message_size(1024);
        assert_eq!(config.max_message_size(), 1024);
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::default()
            .with_ping_delivery()
            .with_utf8()
            .with_close_timeout(Duration::from_secs(3))
            .with_compression_level(CompressionLevel::new(9));

        assert!(config.deliver_ping);
        assert!(config.check_utf8);
        assert_eq!(config.close_timeout(), Duration::from_secs(3));
        assert_eq!(
            config.compression.as_ref().unwrap().level,
            CompressionLevel::new(9)
        );

        assert!(config.without_compression().compression.is_none());
    }

    #[test]
    fn test_deflate_merge() {
        let config = DeflateConfig {
            server_no_context_takeover: true,
            ..Default::default()
        };
        let negotiated = ExtensionConfig::parse_list(
            "permessage-deflate; client_no_context_takeover",
        )
        .unwrap()
        .remove(0);

        let merged = config.merge(&negotiated);
        assert!(merged.server_no_context_takeover);
        assert!(merged.client_no_context_takeover);
    }
}
