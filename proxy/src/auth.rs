use crate::client::Client;

/// Per client visibility and highlight rules, supplied by the embedder.
pub trait Authorization: Send + Sync {
    fn is_channel_whitelisted(&self, client: &Client, channel: &str) -> bool;

    fn is_highlight_match(&self, client: &Client, text: &str) -> bool;
}

/// Every channel is visible and nothing highlights.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl Authorization for Unrestricted {
    fn is_channel_whitelisted(&self, _client: &Client, _channel: &str) -> bool {
        true
    }

    fn is_highlight_match(&self, _client: &Client, _text: &str) -> bool {
        false
    }
}
