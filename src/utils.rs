use crate::peer::types::ServerConfig;
use rand::seq::IndexedRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusty", "eager", "fuzzy", "gentle", "hollow", "icy", "jolly",
    "keen", "lucky", "mellow", "nimble", "odd", "proud", "quiet", "rapid", "sunny", "tidy",
];

const NOUNS: &[&str] = &[
    "badger", "comet", "dingo", "ember", "falcon", "gecko", "heron", "iris", "jackal", "koala",
    "lynx", "moose", "newt", "otter", "panda", "quail", "raven", "salmon", "tapir", "walrus",
];

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Human-readable placeholder name such as `quiet_otter17`.
pub fn random_username() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{adjective}_{noun}{}", rng.random_range(0..100))
}

/// Initial numeric client id, replaced once the server assigns one.
pub fn provisional_client_id() -> u64 {
    (chrono::Utc::now().timestamp_millis() % 1000) as u64
}

/// Adds the scheme to an ICE server URL when it is missing.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
        || config.url.starts_with("stuns:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
