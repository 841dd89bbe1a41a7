//! Message address parsing, grounded in
//! `examples/original_source/libs/grd/include/grd/MessageAddress.h`
//! (`scMessageAddress`): an address is `[protocol::]body`, where `body`
//! is one of a fixed path (`#host/node/task`), a role (`@role`), a
//! virtual path (`//a/b/c`), or a raw, unparsed name.

use nodegrid_shared::{NodegridError, NodegridResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registered as `Role("all")`, `Role("this")`, ... rather than as a
/// distinct `Address` variant: the scheduler dispatch loop recognizes
/// these four role names and the two raw names below by value, exactly
/// as `core.h`'s comment block describes them, instead of the registry
/// resolving them like ordinary roles.
pub const ADDR_ALL: &str = "@all";
pub const ADDR_THIS: &str = "@this";
pub const ADDR_LOCAL: &str = "@local";
pub const ADDR_NULL: &str = "@null";
pub const ADDR_LOG: &str = "@log";
pub const ADDR_CONTROL: &str = "@control";

/// The parsed shape of an address body, mirroring `scAddressFormat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressForm {
    /// `#host/node/task` — any of the three segments may be empty.
    Fixed {
        host: String,
        node: String,
        task: String,
    },
    /// `@role-name` — resolved against the registry's role index.
    Role { role: String },
    /// `//a/b/c` — opaque to the registry, compared by exact string.
    VPath { path: String },
    /// Anything that didn't parse as one of the above; compared as-is.
    Raw { value: String },
}

/// A fully parsed message address: an optional transport protocol tag
/// plus one of the four address forms above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub protocol: String,
    pub form: AddressForm,
}

impl Address {
    pub fn role(name: impl Into<String>) -> Self {
        Address {
            protocol: String::new(),
            form: AddressForm::Role { role: name.into() },
        }
    }

    pub fn fixed(host: impl Into<String>, node: impl Into<String>, task: impl Into<String>) -> Self {
        Address {
            protocol: String::new(),
            form: AddressForm::Fixed {
                host: host.into(),
                node: node.into(),
                task: task.into(),
            },
        }
    }

    pub fn raw(value: impl Into<String>) -> Self {
        Address {
            protocol: String::new(),
            form: AddressForm::Raw { value: value.into() },
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// True for the six reserved role names the scheduler dispatches by
    /// value instead of through registry lookup.
    pub fn is_special(&self) -> bool {
        matches!(
            &self.form,
            AddressForm::Role { role }
                if matches!(role.as_str(), "all" | "this" | "local" | "null" | "log" | "control")
        )
    }

    pub fn is_role(&self) -> bool {
        matches!(self.form, AddressForm::Role { .. })
    }

    /// Parse `address`, validating every byte is printable ASCII
    /// (`0x20..=0x7e`), exactly as `isCtl`/`isAscii` do in the teacher
    /// library. Control bytes and non-ASCII bytes are rejected with the
    /// offending byte offset, which is the only detail `scMessageAddress`
    /// surfaces on a malformed address.
    pub fn parse(address: &str) -> NodegridResult<Address> {
        validate_ascii(address)?;

        let bytes = address.as_bytes();
        let special = bytes
            .iter()
            .position(|&b| matches!(b, b'@' | b'#' | b'/' | b':'));

        let Some(k) = special else {
            return Ok(Address::raw(address));
        };

        match bytes[k] {
            b':' => {
                if bytes.get(k + 1) != Some(&b':') {
                    return Err(parse_err(k, "expected '::' after protocol name"));
                }
                let protocol = &address[..k];
                let rest = &address[k + 2..];
                let mut inner = Self::parse(rest)?;
                inner.protocol = protocol.to_string();
                Ok(inner)
            }
            b'@' => {
                let protocol = address[..k].to_string();
                let role = &address[k + 1..];
                if role.is_empty() {
                    return Err(parse_err(k, "empty role name"));
                }
                if let Some(bad) = role.find(|c| matches!(c, '@' | '#' | '/' | ':')) {
                    return Err(parse_err(k + 1 + bad, "role name cannot contain '@', '#', '/' or ':'"));
                }
                Ok(Address {
                    protocol,
                    form: AddressForm::Role { role: role.to_string() },
                })
            }
            b'#' => {
                let protocol = address[..k].to_string();
                let rest = &address[k + 1..];
                let mut segments = rest.splitn(3, '/');
                let host = segments.next().unwrap_or("").to_string();
                let node = segments.next().unwrap_or("").to_string();
                let task = segments.next().unwrap_or("").to_string();
                if rest.matches('/').count() > 2 {
                    return Err(parse_err(k, "fixed address has too many '/' segments"));
                }
                Ok(Address {
                    protocol,
                    form: AddressForm::Fixed { host, node, task },
                })
            }
            b'/' => {
                if bytes.get(k + 1) != Some(&b'/') {
                    return Err(parse_err(k, "single '/' is not a valid address start"));
                }
                let protocol = address[..k].to_string();
                let tail = &address[k + 2..];
                if let Some(bad) = tail.find(|c| matches!(c, '@' | '#' | ':')) {
                    return Err(parse_err(k + 2 + bad, "virtual path cannot contain '@', '#' or ':'"));
                }
                Ok(Address {
                    protocol,
                    form: AddressForm::VPath {
                        path: format!("//{tail}"),
                    },
                })
            }
            _ => unreachable!("special byte set matches only '@', '#', '/', ':'"),
        }
    }

    /// Inverse of [`Address::parse`]; round-trips for every form this
    /// module constructs.
    pub fn to_wire_string(&self) -> String {
        let mut out = String::new();
        if !self.protocol.is_empty() {
            out.push_str(&self.protocol);
            out.push_str("::");
        }
        match &self.form {
            AddressForm::Fixed { host, node, task } => {
                out.push('#');
                out.push_str(host);
                if !node.is_empty() || !task.is_empty() {
                    out.push('/');
                    out.push_str(node);
                }
                if !task.is_empty() {
                    out.push('/');
                    out.push_str(task);
                }
            }
            AddressForm::Role { role } => {
                out.push('@');
                out.push_str(role);
            }
            AddressForm::VPath { path } => out.push_str(path),
            AddressForm::Raw { value } => out.push_str(value),
        }
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire_string())
    }
}

impl std::str::FromStr for Address {
    type Err = NodegridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

fn validate_ascii(address: &str) -> NodegridResult<()> {
    for (offset, b) in address.bytes().enumerate() {
        if !(0x20..=0x7e).contains(&b) {
            return Err(parse_err(offset, "control or non-ASCII byte in address"));
        }
    }
    Ok(())
}

fn parse_err(offset: usize, message: &str) -> NodegridError {
    NodegridError::AddressParse {
        offset,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed_address() {
        let a = Address::parse("svc::#hostA/node1/task9").unwrap();
        assert_eq!(a.protocol, "svc");
        assert_eq!(
            a.form,
            AddressForm::Fixed {
                host: "hostA".into(),
                node: "node1".into(),
                task: "task9".into(),
            }
        );
    }

    #[test]
    fn parses_role_address() {
        let a = Address::parse("svc::@worker").unwrap();
        assert_eq!(a.protocol, "svc");
        assert_eq!(a.form, AddressForm::Role { role: "worker".into() });
        assert!(!a.is_special());
    }

    #[test]
    fn recognizes_special_roles() {
        for name in [ADDR_ALL, ADDR_THIS, ADDR_LOCAL, ADDR_NULL, ADDR_LOG, ADDR_CONTROL] {
            let a = Address::parse(name).unwrap();
            assert!(a.is_special(), "{name} should be special");
        }
    }

    #[test]
    fn parses_vpath_address() {
        let a = Address::parse("tcp:///virtual/path").unwrap();
        assert_eq!(a.protocol, "tcp");
        assert_eq!(
            a.form,
            AddressForm::VPath {
                path: "//virtual/path".into(),
            }
        );
    }

    #[test]
    fn parses_raw_address_without_protocol() {
        let a = Address::parse("orphan-handle-7").unwrap();
        assert_eq!(a.form, AddressForm::Raw { value: "orphan-handle-7".into() });
    }

    #[test]
    fn rejects_control_bytes_with_offset() {
        let err = Address::parse("svc::#host\x07").unwrap_err();
        match err {
            NodegridError::AddressParse { offset, .. } => assert_eq!(offset, 10),
            other => panic!("expected AddressParse, got {other:?}"),
        }
    }

    #[test]
    fn rejects_single_slash() {
        let err = Address::parse("svc::/oops").unwrap_err();
        assert!(matches!(err, NodegridError::AddressParse { .. }));
    }

    #[test]
    fn rejects_bad_protocol_separator() {
        let err = Address::parse("svc:oops").unwrap_err();
        assert!(matches!(err, NodegridError::AddressParse { .. }));
    }

    #[test]
    fn fixed_address_round_trips() {
        let a = Address::fixed("hostA", "node1", "task9").with_protocol("svc");
        let wire = a.to_wire_string();
        assert_eq!(wire, "svc::#hostA/node1/task9");
        assert_eq!(Address::parse(&wire).unwrap(), a);
    }

    #[test]
    fn fixed_address_with_only_host_round_trips() {
        let a = Address::fixed("hostA", "", "");
        assert_eq!(a.to_wire_string(), "#hostA");
        assert_eq!(Address::parse("#hostA").unwrap(), a);
    }
}
