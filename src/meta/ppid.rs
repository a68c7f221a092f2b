//! Pipeline identifiers.
//!
//! Each pluggable stage (background, segmenter, feature, gate) contributes a
//! sub-identifier of the form `code:k1=v1^k2=v2`, where keys are abbreviated
//! to their shortest prefix that is still unique among the keyword arguments
//! actually present. Six sub-identifiers joined with `|` make up the full
//! pipeline identifier; its MD5 digest, truncated to seven hex characters
//! and prefixed with `dcn-`, is the run id.

use std::collections::BTreeMap;

use md5::{Digest, Md5};

use crate::error::{DcnumError, Result};

/// A single stage's contribution to the pipeline identifier: a code name
/// plus the keyword arguments that parameterize it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubId {
    pub code: String,
    pub kwargs: BTreeMap<String, String>,
}

impl SubId {
    pub fn new(code: impl Into<String>, kwargs: BTreeMap<String, String>) -> Self {
        Self {
            code: code.into(),
            kwargs,
        }
    }

    /// Render as `code:k1=v1^k2=v2`, or just `code` with no kwargs.
    pub fn to_ppid(&self) -> String {
        if self.kwargs.is_empty() {
            return self.code.clone();
        }
        format!("{}:{}", self.code, kwargs_to_ppid(&self.kwargs))
    }

    /// Parse `code:k1=v1^k2=v2` given the full set of keys this code's
    /// implementation accepts (used to resolve abbreviated prefixes back
    /// to their full name).
    pub fn from_ppid(ppid: &str, known_keys: &[&str]) -> Result<Self> {
        match ppid.split_once(':') {
            None => Ok(Self::new(ppid.to_string(), BTreeMap::new())),
            Some((code, rest)) => {
                let kwargs = ppid_to_kwargs(known_keys, rest)?;
                Ok(Self::new(code.to_string(), kwargs))
            }
        }
    }
}

/// Compute, for each key in `keys`, the shortest prefix that uniquely
/// identifies it among all of `keys`.
fn shortest_unique_prefixes(keys: &[String]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for key in keys {
        let mut len = 1;
        loop {
            let candidate = &key[..len.min(key.len())];
            let collides = keys
                .iter()
                .any(|other| other != key && other.starts_with(candidate));
            if !collides || len >= key.len() {
                out.insert(key.clone(), candidate.to_string());
                break;
            }
            len += 1;
        }
    }
    out
}

/// Encode a kwargs map as `k1=v1^k2=v2`, keys sorted and abbreviated to
/// their shortest unique prefix within this map.
pub fn kwargs_to_ppid(kwargs: &BTreeMap<String, String>) -> String {
    let keys: Vec<String> = kwargs.keys().cloned().collect();
    let prefixes = shortest_unique_prefixes(&keys);
    keys.iter()
        .map(|k| format!("{}={}", prefixes[k], kwargs[k]))
        .collect::<Vec<_>>()
        .join("^")
}

/// Decode `k1=v1^k2=v2`, resolving each abbreviated key against the
/// caller-supplied list of full parameter names.
pub fn ppid_to_kwargs(known_keys: &[&str], ppid: &str) -> Result<BTreeMap<String, String>> {
    let full: Vec<String> = known_keys.iter().map(|s| s.to_string()).collect();
    let prefixes = shortest_unique_prefixes(&full);
    let mut out = BTreeMap::new();
    if ppid.is_empty() {
        return Ok(out);
    }
    for pair in ppid.split('^') {
        let (abbrev, value) = pair.split_once('=').ok_or_else(|| {
            DcnumError::Ppid(format!("malformed keyword argument segment: {pair}"))
        })?;
        let full_key = full
            .iter()
            .find(|k| prefixes[*k] == abbrev)
            .or_else(|| full.iter().find(|k| k.as_str() == abbrev))
            .ok_or_else(|| DcnumError::Ppid(format!("unknown keyword argument prefix: {abbrev}")))?;
        out.insert(full_key.clone(), value.to_string());
    }
    Ok(out)
}

/// The full pipeline identifier: one sub-identifier per stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineId {
    pub generation: String,
    pub data: String,
    pub background: String,
    pub segmenter: String,
    pub feature: String,
    pub gate: String,
}

impl PipelineId {
    /// Join all six components with `|`, in fixed order.
    pub fn joined(&self) -> String {
        [
            &self.generation,
            &self.data,
            &self.background,
            &self.segmenter,
            &self.feature,
            &self.gate,
        ]
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("|")
    }

    /// MD5 digest of the joined identifier, as lowercase hex.
    pub fn hash(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.joined().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// `dcn-` followed by the first seven hex characters of the hash.
    pub fn run_id(&self) -> String {
        let h = self.hash();
        format!("dcn-{}", &h[..7])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn abbreviates_to_shortest_unique_prefix() {
        let kw = kwargs(&[("thresh", "-6"), ("blur", "0")]);
        let s = kwargs_to_ppid(&kw);
        assert_eq!(s, "b=0^t=-6");
    }

    #[test]
    fn abbreviation_grows_on_shared_prefix() {
        let kw = kwargs(&[("size_thresh_mask", "12"), ("size_limit", "5")]);
        let s = kwargs_to_ppid(&kw);
        // "size_thresh_mask" and "size_limit" share "si", so each needs
        // enough characters to diverge.
        assert!(s.contains("sit=5") || s.contains("si_l=5") || s.contains("size_l=5"));
    }

    #[test]
    fn round_trips_through_known_keys() {
        let known = ["thresh", "blur"];
        let kw = kwargs(&[("thresh", "-6"), ("blur", "0")]);
        let encoded = kwargs_to_ppid(&kw);
        let decoded = ppid_to_kwargs(&known, &encoded).unwrap();
        assert_eq!(decoded.get("thresh").map(String::as_str), Some("-6"));
        assert_eq!(decoded.get("blur").map(String::as_str), Some("0"));
    }

    #[test]
    fn sub_id_round_trip() {
        let sub = SubId::new("legacy", kwargs(&[("thresh", "-6"), ("blur", "0")]));
        let ppid = sub.to_ppid();
        let parsed = SubId::from_ppid(&ppid, &["thresh", "blur"]).unwrap();
        assert_eq!(parsed.code, "legacy");
        assert_eq!(parsed.kwargs, sub.kwargs);
    }

    #[test]
    fn sub_id_no_kwargs() {
        let sub = SubId::new("norm", BTreeMap::new());
        assert_eq!(sub.to_ppid(), "norm");
        let parsed = SubId::from_ppid("norm", &[]).unwrap();
        assert_eq!(parsed.code, "norm");
        assert!(parsed.kwargs.is_empty());
    }

    #[test]
    fn run_id_is_stable_for_same_inputs() {
        let pid = PipelineId {
            generation: "1".into(),
            data: "hdf:p=0.34".into(),
            background: "sparsemed:k=200".into(),
            segmenter: "legacy:t=-6^b=0".into(),
            feature: "legacy".into(),
            gate: "norm:o=1^s=12".into(),
        };
        let a = pid.run_id();
        let b = pid.run_id();
        assert_eq!(a, b);
        assert!(a.starts_with("dcn-"));
        assert_eq!(a.len(), 11);
    }

    #[test]
    fn malformed_segment_is_rejected() {
        let err = ppid_to_kwargs(&["thresh"], "thresh").unwrap_err();
        assert!(matches!(err, DcnumError::Ppid(_)));
    }
}
