//! Typed configuration of a [`crate::channel::HidppChannel`].

use std::time::Duration;

use crate::vlp::DEFAULT_FRAGMENT_PAYLOAD;

/// Controls timeouts, VLP framing and transient error handling of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ChannelConfig {
    /// How long the blocking request helpers wait for a response.
    pub response_timeout: Duration,

    /// How long a VLP sender waits for each acknowledgement.
    pub vlp_ack_timeout: Duration,

    /// The idle window after which a partial VLP transfer is discarded.
    pub vlp_reassembly_timeout: Duration,

    /// Content bytes carried by each outbound VLP frame.
    pub vlp_fragment_payload: usize,

    /// Report IDs delivered to the HID queue instead of being rejected.
    pub hid_report_ids: Vec<u8>,

    pub restart: RestartPolicy,

    /// The software ID put into outbound requests, `1..=15`.
    pub default_sw_id: u8,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            vlp_ack_timeout: Duration::from_secs(1),
            vlp_reassembly_timeout: Duration::from_secs(2),
            vlp_fragment_payload: DEFAULT_FRAGMENT_PAYLOAD,
            hid_report_ids: Vec::new(),
            restart: RestartPolicy::default(),
            default_sw_id: 0x01,
        }
    }
}

impl ChannelConfig {
    /// Adds report IDs to deliver as plain HID traffic.
    pub fn with_hid_report_ids(mut self, ids: &[u8]) -> Self {
        self.hid_report_ids.extend_from_slice(ids);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

/// How transient transport errors are handled.
///
/// A transport error is transient if
/// [`crate::channel::RawHidChannel::is_transient`] says so. This typically
/// covers pipe and no-device conditions while a device resets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RestartPolicy {
    /// How often a write failing with a transient error is retried.
    pub max_retries: u8,

    /// Whether read errors are dropped silently while a restart window is
    /// open, see [`crate::channel::HidppChannel::begin_restart`]. Otherwise
    /// they are delivered to the error queue.
    pub swallow_during_restart: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            swallow_during_restart: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ChannelConfig::default();

        assert_eq!(config.response_timeout, Duration::from_secs(2));
        assert_eq!(config.vlp_fragment_payload, 59);
        assert_eq!(config.default_sw_id, 1);
        assert_eq!(config.restart.max_retries, 3);
        assert!(!config.restart.swallow_during_restart);
    }

    #[test]
    fn builders_extend_the_defaults() {
        let config = ChannelConfig::default()
            .with_hid_report_ids(&[0x01, 0x02])
            .with_response_timeout(Duration::from_millis(250));

        assert_eq!(config.hid_report_ids, vec![0x01, 0x02]);
        assert_eq!(config.response_timeout, Duration::from_millis(250));
        assert_eq!(config.vlp_ack_timeout, Duration::from_secs(1));
    }
}
