mod engine;

pub use engine::{ConnectState, TokenCipher, STATE_MAX_AGE_SECS};
