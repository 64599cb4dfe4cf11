use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use pkg_types::{ObjectKey, PolicyObject};

/// Point-in-time copy of every object in the store, ordered by key.
///
/// `hash` is the SHA-256 of the canonical JSON encoding of `objects`, so two
/// snapshots with the same content have the same hash regardless of when or
/// at which revision they were taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub revision: u64,
    pub taken_at: DateTime<Utc>,
    pub hash: String,
    pub objects: Vec<PolicyObject>,
}

impl Snapshot {
    pub fn new(revision: u64, taken_at: DateTime<Utc>, mut objects: Vec<PolicyObject>) -> Self {
        objects.sort_by_key(PolicyObject::key);
        let hash = content_hash(&objects);
        Self {
            revision,
            taken_at,
            hash,
            objects,
        }
    }

    /// Recompute the content hash and compare it with the stored one.
    pub fn verify(&self) -> bool {
        content_hash(&self.objects) == self.hash
    }

    pub fn by_key(&self) -> BTreeMap<ObjectKey, &PolicyObject> {
        self.objects.iter().map(|o| (o.key(), o)).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

fn content_hash(objects: &[PolicyObject]) -> String {
    let mut hasher = Sha256::new();
    for object in objects {
        // Serializing plain data structures cannot fail.
        let encoded = serde_json::to_vec(object).unwrap_or_default();
        hasher.update((encoded.len() as u64).to_be_bytes());
        hasher.update(&encoded);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::namespace::Namespace;

    #[test]
    fn hash_ignores_order_and_revision() {
        let a = Namespace::new("a").into();
        let b = Namespace::new("b").into();
        let now = Utc::now();
        let s1 = Snapshot::new(1, now, vec![a, b]);
        let s2 = Snapshot::new(9, now, vec![s1.objects[1].clone(), s1.objects[0].clone()]);
        assert_eq!(s1.hash, s2.hash);
        assert!(s1.verify());
    }

    #[test]
    fn tampered_content_fails_verification() {
        let mut snap = Snapshot::new(1, Utc::now(), vec![Namespace::new("a").into()]);
        snap.objects.push(Namespace::new("z").into());
        assert!(!snap.verify());
        let restored = Snapshot::from_json(&snap.to_json().unwrap()).unwrap();
        assert_eq!(restored, snap);
    }
}
