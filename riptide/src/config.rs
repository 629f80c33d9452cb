use std::time::Duration;
use crate::ID;

const DEFAULT_CLIENT_ID: ID = *b"-RT0010-b91ac6e30f72";

#[derive(Debug, Clone)]
pub struct Config {

    // Unique 20-byte identifier sent in peer handshakes.
    pub client_id: ID,

    // Applied to the TCP connect and to each direction of the handshake.
    pub handshake_timeout: Duration,

    // How long a transmitted block request may stay unanswered.
    pub request_timeout: Duration,

    // How long we wait for a first unchoke after declaring interest.
    pub unchoke_timeout: Duration,

    pub keepalive_interval: Duration,

    // Round-trip budget for a single DHT query.
    pub query_timeout: Duration,

    // Pause before re-seeding an exhausted discovery walk.
    pub requeue_interval: Duration,

    pub bootstrap: String,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            unchoke_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(120),
            query_timeout: Duration::from_secs(5),
            requeue_interval: Duration::from_secs(10),
            bootstrap: "router.bittorrent.com:6881".to_string(),
        }
    }
}
