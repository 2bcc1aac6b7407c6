//! Topic layout shared by the server and the displays.

use crate::core::error::PresenceError;

/// Where announcements go, where presence arrives, and where the server
/// reports its own liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    /// Outbound "new image available" announcements.
    pub image_topic: String,
    /// Two-segment prefix of inbound presence topics (`<prefix>/<clientId>`).
    pub presence_prefix: String,
    /// The server's own ALIVE / DEAD status (DEAD doubles as last will).
    pub status_topic: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            image_topic: "phat/image".to_string(),
            presence_prefix: "phat/client".to_string(),
            status_topic: "phatserver/status".to_string(),
        }
    }
}

impl TopicScheme {
    /// Subscription filter matching every display's presence topic.
    pub fn presence_filter(&self) -> String {
        format!("{}/+", self.presence_prefix)
    }

    /// Extracts the client id from `prefix/prefix/clientId`.
    ///
    /// Exactly three non-empty segments are required and the first two must
    /// equal the configured prefix.
    pub fn client_id<'t>(&self, topic: &'t str) -> Result<&'t str, PresenceError> {
        let malformed = || PresenceError::MalformedTopic(topic.to_string());
        let segments: Vec<&str> = topic.split('/').collect();
        let [first, second, client] = segments.as_slice() else {
            return Err(malformed());
        };
        if client.is_empty() || format!("{first}/{second}") != self.presence_prefix {
            return Err(malformed());
        }
        Ok(*client)
    }
}
