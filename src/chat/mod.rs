//! Chat bookkeeping consumed by the replica manager: users, groups, their
//! session counts and per-group durable history.

mod history;
mod lobby;

pub use history::HistoryFile;
pub use lobby::{Group, JoinOutcome, Lobby, User, NOTICE_SENDER};

/// Checks a user or group name: a letter followed by 3 to 19 letters,
/// digits or dots.
pub fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    let rest = name.len() - 1;
    (3..=19).contains(&rest)
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rules() {
        assert!(valid_name("alice"));
        assert!(valid_name("b.o.b"));
        assert!(valid_name("Zed9"));
        assert!(valid_name("a234567890123456789"));
        assert!(!valid_name("abc"));
        assert!(!valid_name("9lives"));
        assert!(!valid_name(".hidden"));
        assert!(!valid_name("white space"));
        assert!(!valid_name("a2345678901234567890x"));
        assert!(!valid_name("ünïcode"));
        assert!(!valid_name(""));
    }
}
