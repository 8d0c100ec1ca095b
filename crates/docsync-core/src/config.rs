//! Process-wide broker configuration.
//!
//! A small programmatically-constructed struct, since this crate is a library embedded by a
//! host process rather than a standalone daemon reading its own config file. `docsync-server`
//! layers `clap` on top for the few knobs worth flipping at the command line.

use std::time::Duration;

use docsync_pubsub::NodeId;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// This node's identity, used to tag publications and filter self-echoes.
    pub node_id: NodeId,
    /// Grace period after a session's last client detaches before it is disposed.
    pub cleanup_delay: Duration,
    /// How long a replicated message id is remembered for dedupe.
    pub dedupe_ttl: Duration,
    /// Size at which `document-size-warning` fires; `None` disables the check.
    pub size_warning_threshold: Option<u64>,
    /// Size at which `document-size-limit-exceeded` fires; `None` disables the check.
    pub size_limit: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::generate(),
            cleanup_delay: Duration::from_secs(60),
            dedupe_ttl: Duration::from_secs(60),
            size_warning_threshold: None,
            size_limit: None,
        }
    }
}
