//! Host identity codec for the registration handshake.
//!
//! A joining host controller describes itself once, in the body of the
//! `RegisterHost` request: name, versions, and the resource types it
//! declares it does not need mirrored.

use std::collections::{HashMap, HashSet};

use bytes::BufMut;
use nom::{IResult, number::complete::be_i8};
use nombytes::NomBytes;

use crate::encode::{ToByte, encode_as_array, encode_nullable_string};
use crate::error::Result;
use crate::parser::{bytes_to_string, bytes_to_string_opt, parse_array, parse_bool, parse_string};
use crate::types::ManagementVersion;

/// Ignore declaration for one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoredResourceType {
    /// Ignore every resource of the type, regardless of name.
    pub wildcard: bool,
    /// Names ignored individually when `wildcard` is false.
    pub names: HashSet<String>,
}

/// Identity a host controller presents when joining the domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// Unique host name; the key for all per-host state on the master.
    pub name: String,
    pub release_version: String,
    pub product_name: Option<String>,
    pub product_version: Option<String>,
    pub management_version: ManagementVersion,
    /// Declared ignores, keyed by resource type.
    pub ignored_resources: HashMap<String, IgnoredResourceType>,
}

impl HostInfo {
    /// Minimal identity for the current protocol version.
    pub fn new(name: impl Into<String>, release_version: impl Into<String>) -> Self {
        HostInfo {
            name: name.into(),
            release_version: release_version.into(),
            product_name: None,
            product_version: None,
            management_version: ManagementVersion::CURRENT,
            ignored_resources: HashMap::new(),
        }
    }

    /// Declare a whole resource type ignored.
    pub fn ignore_type(mut self, resource_type: impl Into<String>) -> Self {
        self.ignored_resources.insert(
            resource_type.into(),
            IgnoredResourceType {
                wildcard: true,
                names: HashSet::new(),
            },
        );
        self
    }

    /// Declare a single named resource ignored.
    pub fn ignore_named(mut self, resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        let entry = self
            .ignored_resources
            .entry(resource_type.into())
            .or_default();
        entry.names.insert(name.into());
        self
    }

    /// Whether the declared policy covers `(resource_type, name)`.
    pub fn ignores(&self, resource_type: &str, name: &str) -> bool {
        self.ignored_resources
            .get(resource_type)
            .is_some_and(|d| d.wildcard || d.names.contains(name))
    }
}

pub fn parse_host_info(s: NomBytes) -> IResult<NomBytes, HostInfo> {
    let (s, name) = parse_string(s)?;
    let (s, release_version) = parse_string(s)?;
    let (s, product_name) = crate::parser::parse_nullable_string(s)?;
    let (s, product_version) = crate::parser::parse_nullable_string(s)?;
    let (s, major) = be_i8(s)?;
    let (s, minor) = be_i8(s)?;
    let (s, micro) = be_i8(s)?;
    let (s, ignored) = parse_array(parse_ignored_resource)(s)?;

    Ok((
        s,
        HostInfo {
            name: bytes_to_string(&name)?,
            release_version: bytes_to_string(&release_version)?,
            product_name: bytes_to_string_opt(product_name)?,
            product_version: bytes_to_string_opt(product_version)?,
            management_version: ManagementVersion::new(major, minor, micro),
            ignored_resources: ignored.into_iter().collect(),
        },
    ))
}

fn parse_ignored_resource(s: NomBytes) -> IResult<NomBytes, (String, IgnoredResourceType)> {
    let (s, resource_type) = parse_string(s)?;
    let (s, wildcard) = parse_bool(s)?;
    let (s, names) = parse_array(parse_string)(s)?;

    let mut decoded = HashSet::with_capacity(names.len());
    for name in names {
        decoded.insert(bytes_to_string(&name)?);
    }

    Ok((
        s,
        (
            bytes_to_string(&resource_type)?,
            IgnoredResourceType {
                wildcard,
                names: decoded,
            },
        ),
    ))
}

impl ToByte for HostInfo {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.name.encode(buffer)?;
        self.release_version.encode(buffer)?;
        encode_nullable_string(self.product_name.as_deref(), buffer)?;
        encode_nullable_string(self.product_version.as_deref(), buffer)?;
        self.management_version.encode(buffer)?;

        // Deterministic wire order regardless of map iteration order
        let mut ignored: Vec<(&String, &IgnoredResourceType)> =
            self.ignored_resources.iter().collect();
        ignored.sort_by(|a, b| a.0.cmp(b.0));

        encode_as_array(buffer, &ignored, |buffer, (resource_type, decl)| {
            resource_type.encode(buffer)?;
            decl.wildcard.encode(buffer)?;
            let mut names: Vec<&String> = decl.names.iter().collect();
            names.sort();
            encode_as_array(buffer, &names, |buffer, name| name.encode(buffer))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn roundtrip(info: &HostInfo) -> HostInfo {
        let mut buf = Vec::new();
        info.encode(&mut buf).unwrap();
        let (rest, parsed) = parse_host_info(NomBytes::new(Bytes::from(buf))).unwrap();
        assert!(rest.into_bytes().is_empty());
        parsed
    }

    #[test]
    fn minimal_host_info_roundtrip() {
        let info = HostInfo::new("hc01", "30.0.1.Final");
        let parsed = roundtrip(&info);
        assert_eq!(parsed, info);
    }

    #[test]
    fn full_host_info_roundtrip() {
        let mut info = HostInfo::new("hc02", "30.0.1.Final")
            .ignore_type("extension")
            .ignore_named("profile", "ha")
            .ignore_named("profile", "full-ha");
        info.product_name = Some("Fleet AS".to_string());
        info.product_version = Some("8.1".to_string());
        info.management_version = ManagementVersion::new(2, 1, 0);

        let parsed = roundtrip(&info);
        assert_eq!(parsed, info);
        assert_eq!(parsed.management_version, ManagementVersion::new(2, 1, 0));
    }

    #[test]
    fn ignores_wildcard() {
        let info = HostInfo::new("hc", "1").ignore_type("extension");
        assert!(info.ignores("extension", "org.fleet.clustering"));
        assert!(!info.ignores("profile", "ha"));
    }

    #[test]
    fn ignores_named_only() {
        let info = HostInfo::new("hc", "1").ignore_named("server-group", "batch");
        assert!(info.ignores("server-group", "batch"));
        assert!(!info.ignores("server-group", "web"));
    }

    #[test]
    fn parse_rejects_truncated_body() {
        let info = HostInfo::new("hc01", "30.0.1.Final").ignore_type("profile");
        let mut buf = Vec::new();
        info.encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(parse_host_info(NomBytes::new(Bytes::from(buf))).is_err());
    }
}
