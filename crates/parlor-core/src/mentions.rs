//! Mention extraction from message content.
//!
//! `@name` tokens are matched against the usernames of the room's current
//! members, case-insensitively. Only resolved members produce mentions;
//! unknown names are plain text. Mentions drive notifications, they do not
//! alter the stored message content.

use std::collections::{BTreeMap, HashMap};

use crate::room::UserId;

/// Extracts mentioned user ids from `content`.
///
/// A mention is `@` followed by a run of ASCII alphanumerics or
/// underscores, where the `@` is not directly preceded by an alphanumeric
/// character (so email addresses do not count). Results are deduplicated
/// in first-mention order; the sender never mentions themselves.
pub fn resolve_mentions(
    content: &str,
    names: &HashMap<UserId, String>,
    sender: UserId,
) -> Vec<UserId> {
    // Lowercased name -> user id. Usernames are unique upstream; if the
    // directory ever disagrees, the lowest id wins deterministically.
    let mut directory: BTreeMap<String, UserId> = BTreeMap::new();
    for (user_id, name) in names {
        directory
            .entry(name.to_lowercase())
            .and_modify(|existing| *existing = (*existing).min(*user_id))
            .or_insert(*user_id);
    }

    let mut found = Vec::new();
    let mut prev: Option<char> = None;
    for (index, ch) in content.char_indices() {
        let at_mention_start = ch == '@' && !prev.is_some_and(char::is_alphanumeric);
        prev = Some(ch);
        if !at_mention_start {
            continue;
        }

        let rest = &content[index + 1..];
        let token_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if token_len == 0 {
            continue;
        }

        let token = &rest[..token_len];
        if let Some(&user_id) = directory.get(&token.to_lowercase()) {
            if user_id != sender && !found.contains(&user_id) {
                found.push(user_id);
            }
        }
    }
    found
}
