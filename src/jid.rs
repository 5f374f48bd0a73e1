//! XMPP addresses (JIDs) as described in RFC 6122.
//!
//! The syntax for a JID is defined as follows using the Augmented
//! Backus-Naur Form:
//!
//! ```text
//! jid = [ localpart "@" ] domainpart [ "/" resourcepart ]
//! ```
//!
//! Parsing splits the string at the *first* `@` and the *first* `/` before
//! any Unicode transformation is applied, because some code points decompose
//! to the separator characters (for example U+FE6B SMALL COMMERCIAL AT
//! decomposes into U+0040 COMMERCIAL AT). Each non-empty part is then
//! normalized independently with the stringprep profiles from RFC 6122
//! (Nodeprep, Nameprep and Resourceprep, all of which apply NFKC).

use core::fmt;
use core::str::FromStr;
use std::borrow::Cow;
use std::net::Ipv6Addr;

/// The maximum length of a single JID part, in bytes, after normalization.
const MAX_PART_LEN: usize = 1023;

/// Characters that must never appear in a localpart.
const LOCAL_ILLEGAL: &[char] = &['"', '&', '\'', '/', ':', '<', '>', '@'];

/// An error produced while parsing or constructing a [`Jid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The input is not valid UTF-8.
    InvalidUtf8,
    /// A JID part was empty after normalization.
    EmptyPart,
    /// A JID part exceeded 1023 bytes after normalization.
    LongPart,
    /// A JID part contains a character which is prohibited by its
    /// stringprep profile or by RFC 6122.
    IllegalRune,
    /// A JID part contains whitespace.
    IllegalWhitespace,
    /// The string is not a well-formed JID.
    Malformed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Error::InvalidUtf8 => "string is not valid UTF-8",
            Error::EmptyPart => "JID parts must be greater than 0 bytes",
            Error::LongPart => "JID parts must be less than 1024 bytes",
            Error::IllegalRune => "string contains an illegal character",
            Error::IllegalWhitespace => "string contains illegal whitespace",
            Error::Malformed => "string is not a valid JID",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}

/// A parsed and normalized JID.
///
/// JIDs are immutable values: every constructor normalizes and validates its
/// input, and the accessors only hand out references. Equality and hashing
/// operate componentwise over the normalized parts, so
/// `mercutio@example.net` and `MERCUTIO@EXAMPLE.NET` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Constructs a JID from its individual parts.
    ///
    /// Every part is normalized and validated; `local` and `resource` may be
    /// omitted to form a bare or domain-only JID.
    pub fn new(
        local: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Jid, Error> {
        Ok(Jid {
            local: local.map(prep_localpart).transpose()?,
            domain: prep_domainpart(domain)?,
            resource: resource.map(prep_resourcepart).transpose()?,
        })
    }

    /// Parses a JID from raw bytes, rejecting invalid UTF-8.
    ///
    /// This is a convenience for addresses read off the wire; `str` input
    /// can go through [`FromStr`] instead.
    pub fn from_bytes(bytes: &[u8]) -> Result<Jid, Error> {
        core::str::from_utf8(bytes)
            .map_err(|_| Error::InvalidUtf8)?
            .parse()
    }

    /// The localpart (the part before the `@`), if any.
    pub fn localpart(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// The domainpart. This is the only required part of a JID.
    pub fn domainpart(&self) -> &str {
        &self.domain
    }

    /// The resourcepart (the part after the `/`), if any.
    pub fn resourcepart(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Returns a copy of this JID with the resourcepart removed.
    pub fn bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Returns a domain-only copy of this JID.
    pub fn domain(&self) -> Jid {
        Jid {
            local: None,
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Whether this JID has no resourcepart.
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// Returns a copy of this JID carrying the given resourcepart.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, Error> {
        Ok(Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(prep_resourcepart(resource)?),
        })
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Jid, Error> {
        // Match the separators before any transformation; see the module
        // documentation.
        let (head, resource) = match s.find('/') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };
        let (local, domain) = match head.find('@') {
            Some(i) => (Some(&head[..i]), &head[i + 1..]),
            None => (None, head),
        };
        Jid::new(local, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref local) = self.local {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(ref resource) = self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl xso::FromXmlText for Jid {
    fn from_xml_text(value: String) -> Result<Jid, xso::error::Error> {
        value.parse().map_err(xso::error::Error::text_parse_error)
    }
}

impl xso::AsXmlText for Jid {
    fn as_xml_text(&self) -> Result<Cow<'_, str>, xso::error::Error> {
        Ok(Cow::Owned(self.to_string()))
    }
}

/// Validates the length and whitespace rules shared by all parts.
fn check_part(part: &str) -> Result<(), Error> {
    match part.len() {
        0 => Err(Error::EmptyPart),
        n if n > MAX_PART_LEN => Err(Error::LongPart),
        _ if part.contains(char::is_whitespace) => Err(Error::IllegalWhitespace),
        _ => Ok(()),
    }
}

fn prep_localpart(part: &str) -> Result<String, Error> {
    check_part(part)?;
    if part.contains(LOCAL_ILLEGAL) {
        return Err(Error::IllegalRune);
    }
    let normalized = stringprep::nodeprep(part).map_err(|_| Error::IllegalRune)?;
    // Normalization may decompose code points into characters the raw input
    // did not contain, so the checks run on the normalized form as well.
    check_part(&normalized)?;
    if normalized.contains(LOCAL_ILLEGAL) {
        return Err(Error::IllegalRune);
    }
    Ok(normalized.into_owned())
}

fn prep_domainpart(part: &str) -> Result<String, Error> {
    // RFC 6122 §2.2: a final label separator (dot) must be stripped before
    // any other canonicalization step is taken.
    let part = part.trim_end_matches('.');

    // An IP literal is kept verbatim; everything else goes through Nameprep.
    if let Some(inner) = part
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        return match inner.parse::<Ipv6Addr>() {
            Ok(_) => Ok(part.to_owned()),
            Err(_) => Err(Error::Malformed),
        };
    }

    check_part(part)?;
    let normalized = stringprep::nameprep(part).map_err(|_| Error::IllegalRune)?;
    check_part(&normalized)?;
    if normalized.contains('@') {
        return Err(Error::Malformed);
    }
    // A bare IPv6 address is wrapped in brackets, as required since RFC
    // 3920's address syntax was replaced by the RFC 3986 IP-literal rule.
    if normalized.parse::<Ipv6Addr>().is_ok() {
        return Ok(format!("[{}]", normalized));
    }
    Ok(normalized.into_owned())
}

fn prep_resourcepart(part: &str) -> Result<String, Error> {
    check_part(part)?;
    let normalized = stringprep::resourceprep(part).map_err(|_| Error::IllegalRune)?;
    check_part(&normalized)?;
    Ok(normalized.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_jids() {
        for (jid, lp, dp, rp) in [
            ("example.net", None, "example.net", None),
            ("example.net/rp", None, "example.net", Some("rp")),
            ("mercutio@example.net", Some("mercutio"), "example.net", None),
            (
                "mercutio@example.net/rp",
                Some("mercutio"),
                "example.net",
                Some("rp"),
            ),
            (
                "mercutio@example.net/rp@rp",
                Some("mercutio"),
                "example.net",
                Some("rp@rp"),
            ),
            (
                "mercutio@example.net/rp@rp/rp",
                Some("mercutio"),
                "example.net",
                Some("rp@rp/rp"),
            ),
            (
                "mercutio@example.net/@",
                Some("mercutio"),
                "example.net",
                Some("@"),
            ),
            (
                "mercutio@example.net//@",
                Some("mercutio"),
                "example.net",
                Some("/@"),
            ),
            (
                "mercutio@example.net//@//",
                Some("mercutio"),
                "example.net",
                Some("/@//"),
            ),
        ] {
            let j: Jid = jid.parse().unwrap_or_else(|e| panic!("{}: {}", jid, e));
            assert_eq!(j.localpart(), lp, "localpart of {}", jid);
            assert_eq!(j.domainpart(), dp, "domainpart of {}", jid);
            assert_eq!(j.resourcepart(), rp, "resourcepart of {}", jid);
        }
    }

    #[test]
    fn invalid_jids() {
        for jid in [
            "",
            "test@/test",
            "lp@/rp",
            "@example.net",
            "example.net/",
            "lp@example.net/ rp",
            "white space@example.net",
            "<strange>@example.net",
            "a@b@example.net",
        ] {
            assert!(jid.parse::<Jid>().is_err(), "expected {:?} to fail", jid);
        }
    }

    #[test]
    fn invalid_utf8() {
        let bad = [0xff, 0xfe, 0xfd];
        for jid in [
            bad.to_vec(),
            [&bad[..], b"@example.com/rp"].concat(),
            [&bad[..], b"/rp"].concat(),
            [b"example.com/", &bad[..]].concat(),
        ] {
            assert_eq!(Jid::from_bytes(&jid), Err(Error::InvalidUtf8));
        }
    }

    #[test]
    fn string_round_trip() {
        for s in [
            "example.net",
            "mercutio@example.net",
            "mercutio@example.net/rp@rp/rp",
            "mercutio@example.net//@//",
            "[::1]",
        ] {
            let j: Jid = s.parse().unwrap();
            assert_eq!(j.to_string(), s);
        }
    }

    #[test]
    fn normalization() {
        let j: Jid = "MERCUTIO@EXAMPLE.net./resource".parse().unwrap();
        assert_eq!(j.to_string(), "mercutio@example.net/resource");
        assert_eq!(
            "MERCUTIO@example.net".parse::<Jid>().unwrap(),
            "mercutio@example.net".parse::<Jid>().unwrap(),
        );
    }

    #[test]
    fn trailing_dots_are_stripped() {
        let j: Jid = "example.net.".parse().unwrap();
        assert_eq!(j.domainpart(), "example.net");
        let j: Jid = "example.net...".parse().unwrap();
        assert_eq!(j.domainpart(), "example.net");
    }

    #[test]
    fn ipv6_literals() {
        let j: Jid = "user@[2001:db8::1]".parse().unwrap();
        assert_eq!(j.domainpart(), "[2001:db8::1]");
        let j: Jid = "user@::1/rp".parse().unwrap();
        assert_eq!(j.domainpart(), "[::1]");
        assert!("user@[not-an-ip]".parse::<Jid>().is_err());
    }

    #[test]
    fn part_length_boundary() {
        let longest = "a".repeat(1023);
        let jid = format!("{}@example.net", longest);
        assert!(jid.parse::<Jid>().is_ok());

        let too_long = "a".repeat(1024);
        let jid = format!("{}@example.net", too_long);
        assert_eq!(jid.parse::<Jid>(), Err(Error::LongPart));
    }

    #[test]
    fn bare_is_idempotent() {
        let j: Jid = "mercutio@example.net/rp".parse().unwrap();
        let bare = j.bare();
        assert_eq!(bare.to_string(), "mercutio@example.net");
        assert_eq!(bare.bare(), bare);
        assert!(bare.is_bare());
    }

    #[test]
    fn with_resource() {
        let j: Jid = "mercutio@example.net".parse().unwrap();
        let full = j.with_resource("balcony").unwrap();
        assert_eq!(full.to_string(), "mercutio@example.net/balcony");
        assert_eq!(full.bare(), j);
    }

    #[test]
    fn equality_ignores_resource_only_for_bare() {
        let a: Jid = "mercutio@example.net/a".parse().unwrap();
        let b: Jid = "mercutio@example.net/b".parse().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.bare(), b.bare());
    }
}
