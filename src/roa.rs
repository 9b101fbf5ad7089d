//! Canonical VRP record type and upstream parsing.
//!
//! A [`Roa`] is one validated authorization: prefix `P` may be originated by
//! AS `A` up to maximum length `M`, under trust anchor `T`, expiring at `E`.
//!
//! Upstream validators render this record in two JSON shapes:
//! - *compact* (rpki-client): `{asn, prefix, maxLength, ta, expires}` where
//!   `asn` may be an integer or a string like `"AS12345"` and `expires` may
//!   be absent (older archives).
//! - *extended* (routinator jsonext): `{asn, prefix, maxLength, source: [..]}`
//!   where the trust anchor and staleness time live in the first `source`
//!   attestation entry.
//!
//! Both shapes deserialize into the same canonical value, which serializes
//! back out with the stable key order `{asn, expires, maxLength, prefix, ta}`.

use crate::{Result, RpkilogError};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use tracing::debug;

/// Parse an ASN from any of its upstream renderings: plain integer text or
/// the `"AS12345"`/`"as12345"` string forms of older VRP cache files.
pub fn parse_asn(value: &str) -> Result<u32> {
    let num_str = value
        .strip_prefix("AS")
        .or_else(|| value.strip_prefix("as"))
        .unwrap_or(value);
    num_str.parse::<u32>().map_err(|_| RpkilogError::InvalidAsn {
        input: value.to_string(),
    })
}

/// Custom deserializer for ASN that handles both numeric and string formats.
fn deserialize_asn<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct AsnVisitor;

    impl<'de> Visitor<'de> for AsnVisitor {
        type Value = u32;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an ASN as a number or string like 'AS12345'")
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            u32::try_from(value).map_err(|_| {
                E::custom(RpkilogError::InvalidAsn {
                    input: value.to_string(),
                })
            })
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            u32::try_from(value).map_err(|_| {
                E::custom(RpkilogError::InvalidAsn {
                    input: value.to_string(),
                })
            })
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            parse_asn(value).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(AsnVisitor)
}

/// Custom deserializer for expires that handles both i64 and u64.
fn deserialize_expires<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct ExpiresVisitor;

    impl<'de> Visitor<'de> for ExpiresVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a timestamp as a number")
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value >= 0 {
                Ok(value as u64)
            } else {
                Err(E::custom(format!("negative timestamp: {}", value)))
            }
        }
    }

    deserializer.deserialize_any(ExpiresVisitor)
}

/// One attestation entry of the extended (jsonext) schema. Only the fields
/// needed for canonicalization are kept.
#[derive(Clone, Debug, Deserialize)]
struct UpstreamSource {
    tal: String,
    #[serde(default)]
    stale: Option<String>,
}

/// Wire-shape record covering both upstream schema variants. Field presence
/// decides which variant a record is; see [`Roa::from_upstream`].
#[derive(Clone, Debug, Deserialize)]
struct UpstreamRoa {
    #[serde(deserialize_with = "deserialize_asn")]
    asn: u32,
    prefix: String,
    #[serde(rename = "maxLength")]
    max_length: i64,
    #[serde(default)]
    ta: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_expires")]
    expires: Option<u64>,
    #[serde(default)]
    source: Vec<UpstreamSource>,
}

fn deserialize_opt_expires<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_expires(deserializer).map(Some)
}

/// A validated Route Origin Authorization (ROA) payload.
#[derive(Clone, Debug)]
pub struct Roa {
    /// The IP prefix, stored truncated to its network address
    pub prefix: IpNet,
    /// Maximum prefix length allowed for announcements
    pub max_length: u8,
    /// The AS number authorized to originate this prefix
    pub asn: u32,
    /// Trust anchor label (e.g. "apnic", "arin")
    pub ta: String,
    /// Expiry as seconds since the Unix epoch; 0 when unknown
    pub expires: u64,
    /// Host the snapshot was observed from, when known
    pub source_host: Option<String>,
    /// Observation time of the snapshot, when known
    pub source_time: Option<DateTime<Utc>>,
}

impl Roa {
    /// Construct a validated Roa. The prefix is truncated to its network
    /// address so equal authorizations compare equal regardless of how the
    /// upstream rendered host bits.
    pub fn new(asn: u32, prefix: IpNet, max_length: i64, ta: &str, expires: u64) -> Result<Self> {
        let prefix = prefix.trunc();
        if max_length < prefix.prefix_len() as i64 || max_length > prefix.max_prefix_len() as i64 {
            return Err(RpkilogError::InvalidMaxLength {
                max_length,
                prefix: prefix.to_string(),
            });
        }
        if ta.is_empty() {
            return Err(RpkilogError::MissingRequired { field: "ta" });
        }
        Ok(Roa {
            prefix,
            max_length: max_length as u8,
            asn,
            ta: ta.to_string(),
            expires,
            source_host: None,
            source_time: None,
        })
    }

    /// Parse one record from either upstream schema variant.
    pub fn parse_upstream(record: serde_json::Value) -> Result<Self> {
        let raw: UpstreamRoa = serde_json::from_value(record)?;
        Self::from_upstream(raw)
    }

    fn from_upstream(raw: UpstreamRoa) -> Result<Self> {
        let prefix: IpNet = raw
            .prefix
            .parse()
            .map_err(|e: ipnet::AddrParseError| RpkilogError::invalid_prefix(&raw.prefix, e.to_string()))?;

        let (ta, expires) = if let Some(ta) = raw.ta {
            // compact schema; expires defaults to 0 for old archives that omit it
            (ta, raw.expires.unwrap_or(0))
        } else if let Some(selected) = raw.source.first() {
            if raw.source.len() > 1 {
                debug!(
                    "record for {} has {} source attestations, using the first",
                    raw.prefix,
                    raw.source.len()
                );
            }
            let stale = selected
                .stale
                .as_deref()
                .ok_or(RpkilogError::MissingRequired { field: "source[0].stale" })?;
            let stale_time = DateTime::parse_from_rfc3339(stale)?;
            let expires = u64::try_from(stale_time.timestamp()).map_err(|_| {
                RpkilogError::UnrecognizedSchema {
                    details: format!("source stale time before the epoch: {}", stale),
                }
            })?;
            (selected.tal.clone(), expires)
        } else {
            return Err(RpkilogError::UnrecognizedSchema {
                details: format!("record for {} has neither 'ta' nor 'source'", raw.prefix),
            });
        };

        Roa::new(raw.asn, prefix, raw.max_length, &ta, expires)
    }

    /// Attach provenance for records parsed out of a snapshot.
    pub fn with_provenance(
        mut self,
        source_host: Option<String>,
        source_time: Option<DateTime<Utc>>,
    ) -> Self {
        self.source_host = source_host;
        self.source_time = source_time;
        self
    }

    /// The identity of this authorization across time: `(prefix, maxLength,
    /// asn, ta)`. Two records with the same primary key but different
    /// `expires` are the same authorization, renewed.
    pub fn primary_key(&self) -> (IpNet, u8, u32, &str) {
        (self.prefix, self.max_length, self.asn, &self.ta)
    }

    /// Prefix component of the sort key: IPv4 sorts before IPv6, numerically
    /// ascending within each family, by network address then prefix length.
    fn prefix_sort_key(&self) -> (u8, u128, u8) {
        match self.prefix {
            IpNet::V4(net) => (4, u32::from(net.network()) as u128, net.prefix_len()),
            IpNet::V6(net) => (6, u128::from(net.network()), net.prefix_len()),
        }
    }

    /// Canonical JSON object with stable key order.
    pub fn as_json_obj(&self) -> serde_json::Value {
        serde_json::json!({
            "asn": self.asn,
            "expires": self.expires,
            "maxLength": self.max_length,
            "prefix": self.prefix.to_string(),
            "ta": self.ta,
        })
    }
}

impl PartialEq for Roa {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Roa {}

impl PartialOrd for Roa {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Roa {
    /// Total order used for diffing: prefix sort key, then maxLength, asn,
    /// ta, expires. Provenance fields do not participate.
    fn cmp(&self, other: &Self) -> Ordering {
        self.prefix_sort_key()
            .cmp(&other.prefix_sort_key())
            .then_with(|| self.max_length.cmp(&other.max_length))
            .then_with(|| self.asn.cmp(&other.asn))
            .then_with(|| self.ta.cmp(&other.ta))
            .then_with(|| self.expires.cmp(&other.expires))
    }
}

impl Serialize for Roa {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("Roa", 5)?;
        s.serialize_field("asn", &self.asn)?;
        s.serialize_field("expires", &self.expires)?;
        s.serialize_field("maxLength", &self.max_length)?;
        s.serialize_field("prefix", &self.prefix)?;
        s.serialize_field("ta", &self.ta)?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for Roa {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = UpstreamRoa::deserialize(deserializer)?;
        Roa::from_upstream(raw).map_err(serde::de::Error::custom)
    }
}
