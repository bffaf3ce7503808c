//! Server address parsing.
//!
//! An address is a semicolon-separated list of entries, each of the form
//! `method:key=value,key=value`. Entries are tried in listed order by the
//! transport opener chain. The parser ignores keys it does not know;
//! individual transports may require specific ones (`unix` requires
//! `path`, `tcp` requires `port`, …). The one key with common meaning is
//! `guid`, the server identity a client pins to.

use thiserror::Error;

/// A single parsed `method:key=value,...` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    method: String,
    params: Vec<(String, String)>,
}

impl AddressEntry {
    /// The entry's transport method (`unix`, `tcp`, …).
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Looks up a key's value. First occurrence wins.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Display for AddressEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.method)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Problems with the textual form of an address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AddressError {
    /// The address contained no entries at all.
    #[error("address is empty")]
    Empty,

    /// An entry did not start with `method:`.
    #[error("address entry {entry:?} has no method: expected \"method:key=value,...\"")]
    MissingMethod {
        /// The offending entry text.
        entry: String,
    },

    /// A parameter was not a `key=value` pair with a non-empty key.
    #[error("malformed parameter {pair:?} in address entry for method {method:?}")]
    MalformedParameter {
        /// The entry's method.
        method: String,
        /// The offending parameter text.
        pair: String,
    },
}

/// Parses an address into its entries, preserving listed order.
///
/// # Errors
///
/// Returns [`AddressError`] when the address or one of its entries is
/// syntactically invalid. Trailing semicolons are tolerated.
pub fn parse_address(address: &str) -> Result<Vec<AddressEntry>, AddressError> {
    let mut entries = Vec::new();
    for raw in address.split(';') {
        if raw.is_empty() {
            continue;
        }
        entries.push(parse_entry(raw)?);
    }
    if entries.is_empty() {
        return Err(AddressError::Empty);
    }
    Ok(entries)
}

fn parse_entry(raw: &str) -> Result<AddressEntry, AddressError> {
    let Some((method, rest)) = raw.split_once(':') else {
        return Err(AddressError::MissingMethod {
            entry: raw.to_owned(),
        });
    };
    if method.is_empty() {
        return Err(AddressError::MissingMethod {
            entry: raw.to_owned(),
        });
    }

    let mut params = Vec::new();
    if !rest.is_empty() {
        for pair in rest.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(AddressError::MalformedParameter {
                    method: method.to_owned(),
                    pair: pair.to_owned(),
                });
            };
            if key.is_empty() {
                return Err(AddressError::MalformedParameter {
                    method: method.to_owned(),
                    pair: pair.to_owned(),
                });
            }
            params.push((key.to_owned(), value.to_owned()));
        }
    }

    Ok(AddressEntry {
        method: method.to_owned(),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_entry_with_params() {
        let entries = parse_address("unix:path=/tmp/test,guid=1234abcd").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method(), "unix");
        assert_eq!(entries[0].get("path"), Some("/tmp/test"));
        assert_eq!(entries[0].get("guid"), Some("1234abcd"));
        assert_eq!(entries[0].get("port"), None);
    }

    #[test]
    fn multiple_entries_keep_order() {
        let entries = parse_address("tcp:host=localhost,port=1234;unix:path=/x").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].method(), "tcp");
        assert_eq!(entries[1].method(), "unix");
    }

    #[test]
    fn method_without_params_is_valid() {
        let entries = parse_address("autolaunch:").unwrap();
        assert_eq!(entries[0].method(), "autolaunch");
        assert_eq!(entries[0].get("anything"), None);
    }

    #[test]
    fn trailing_semicolon_tolerated() {
        let entries = parse_address("unix:path=/tmp/sock;").unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn empty_value_is_allowed() {
        let entries = parse_address("unix:path=").unwrap();
        assert_eq!(entries[0].get("path"), Some(""));
    }

    #[test]
    fn rejects_empty_address() {
        assert_eq!(parse_address(""), Err(AddressError::Empty));
        assert_eq!(parse_address(";;"), Err(AddressError::Empty));
    }

    #[test]
    fn rejects_missing_method() {
        assert!(matches!(
            parse_address("no-colon-here"),
            Err(AddressError::MissingMethod { .. })
        ));
        assert!(matches!(
            parse_address(":path=/tmp"),
            Err(AddressError::MissingMethod { .. })
        ));
    }

    #[test]
    fn rejects_malformed_parameter() {
        assert!(matches!(
            parse_address("unix:path"),
            Err(AddressError::MalformedParameter { .. })
        ));
        assert!(matches!(
            parse_address("unix:=value"),
            Err(AddressError::MalformedParameter { .. })
        ));
    }

    #[test]
    fn display_round_trips() {
        let text = "unix:path=/tmp/test,guid=1234abcd";
        let entries = parse_address(text).unwrap();
        assert_eq!(entries[0].to_string(), text);
    }

    #[test]
    fn first_duplicate_key_wins() {
        let entries = parse_address("unix:path=/a,path=/b").unwrap();
        assert_eq!(entries[0].get("path"), Some("/a"));
    }
}
