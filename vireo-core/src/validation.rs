//! Grammars for the names and words accepted from clients and from the configuration.

const MAX_KEY_LENGTH: usize = 23;

fn is_special(c: u8) -> bool {
    matches!(c, b'[' | b']' | b'\\' | b'`' | b'_' | b'^' | b'{' | b'|' | b'}')
}

/// nickname ::= ( letter / special ) *( letter / digit / special / "-" )
pub(crate) fn is_valid_nickname(nickname: &str, max_length: usize) -> bool {
    let bytes = nickname.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return false;
    };

    bytes.len() <= max_length
        && (first.is_ascii_alphabetic() || is_special(first))
        && rest
            .iter()
            .all(|&c| c.is_ascii_alphanumeric() || is_special(c) || c == b'-')
}

/// channel ::= "#" chanstring, where chanstring excludes NUL, BELL, CR, LF, space, comma and colon
pub(crate) fn is_valid_channel_name(name: &str, max_length: usize) -> bool {
    let Some(chanstring) = name.strip_prefix('#') else {
        return false;
    };

    !chanstring.is_empty()
        && name.len() <= max_length
        && chanstring
            .bytes()
            .all(|c| !matches!(c, 0 | 0x07 | b'\r' | b'\n' | b' ' | b',' | b':'))
}

/// key ::= 1*23( any octet except NUL, CR, LF, FF, HT, VT, space and comma )
pub(crate) fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key
            .bytes()
            .all(|c| !c.is_ascii_control() && c != b' ' && c != b',')
}

/// user ::= 1*( any octet except NUL, CR, LF, space and "@" )
pub(crate) fn is_valid_username(username: &[u8]) -> bool {
    !username.is_empty()
        && username
            .iter()
            .all(|&c| !matches!(c, 0 | b'\r' | b'\n' | b' ' | b'@'))
}

pub(crate) fn is_valid_realname(realname: &[u8]) -> bool {
    !realname.is_empty() && realname.iter().all(|&c| !c.is_ascii_control())
}

/// Dot-separated labels of letters, digits and dashes; labels start and end with a
/// letter or a digit.
pub(crate) fn is_valid_server_name(name: &str, max_length: usize) -> bool {
    if name.is_empty() || name.len() > max_length {
        return false;
    }

    name.split('.').all(|label| {
        let bytes = label.as_bytes();
        match (bytes.first(), bytes.last()) {
            (Some(first), Some(last)) => {
                first.is_ascii_alphanumeric()
                    && last.is_ascii_alphanumeric()
                    && bytes.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'-')
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("alice", true)]
    #[case("Bob_", true)]
    #[case("[away]", true)]
    #[case("a-1", true)]
    #[case("{x}|y^", true)]
    #[case("", false)]
    #[case("1abc", false)]
    #[case("-abc", false)]
    #[case("ab cd", false)]
    #[case("ab,cd", false)]
    #[case("tėst", false)]
    #[case("abcdefghij", false)]
    fn nicknames(#[case] nickname: &str, #[case] valid: bool) {
        assert_eq!(is_valid_nickname(nickname, 9), valid);
    }

    #[rstest]
    #[case("#room", true)]
    #[case("#a", true)]
    #[case("#rust-lang.fr", true)]
    #[case("#", false)]
    #[case("room", false)]
    #[case("&room", false)]
    #[case("#ro om", false)]
    #[case("#ro,om", false)]
    #[case("#ro:om", false)]
    #[case("#ro\x07om", false)]
    #[case("#0123456789abcdefg", false)]
    fn channel_names(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(is_valid_channel_name(name, 16), valid);
    }

    #[rstest]
    #[case("secret", true)]
    #[case("p@ss:w0rd", true)]
    #[case("", false)]
    #[case("two words", false)]
    #[case("a,b", false)]
    #[case("tab\there", false)]
    #[case("012345678901234567890123", false)]
    fn keys(#[case] key: &str, #[case] valid: bool) {
        assert_eq!(is_valid_key(key), valid);
    }

    #[rstest]
    #[case(b"alice", true)]
    #[case(b"~al.ice", true)]
    #[case(b"", false)]
    #[case(b"al ice", false)]
    #[case(b"al@ice", false)]
    fn usernames(#[case] username: &[u8], #[case] valid: bool) {
        assert_eq!(is_valid_username(username), valid);
    }

    #[test]
    fn realnames() {
        assert!(is_valid_realname(b"Alice A"));
        assert!(is_valid_realname("Zoë Ünal".as_bytes()));
        assert!(!is_valid_realname(b""));
        assert!(!is_valid_realname(b"bell\x07"));
    }

    #[rstest]
    #[case("irc.example.org", true)]
    #[case("localhost", true)]
    #[case("irc-1.example", true)]
    #[case("", false)]
    #[case("irc..example", false)]
    #[case("-irc.example", false)]
    #[case("irc.example-", false)]
    #[case("irc_example", false)]
    fn server_names(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(is_valid_server_name(name, 63), valid);
    }
}
