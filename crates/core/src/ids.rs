//! Message id generation for acknowledgment-tracked sends.

use rand::Rng;

use crate::types::now_millis;

/// Number of random characters appended after the timestamp.
pub const ID_SUFFIX_LENGTH: usize = 9;

/// Generate a message id of the form `<epoch-millis>-<random suffix>`.
///
/// Two ids generated in the same millisecond still differ by their
/// alphanumeric suffix (62^9 possibilities).
pub fn generate_message_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(ID_SUFFIX_LENGTH)
        .map(char::from)
        .collect();

    format!("{}-{}", now_millis(), suffix)
}
