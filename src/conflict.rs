// conflict.rs - Field-level divergence detector
//
// Pure and deterministic: a function of (local, server, kind) alone, no I/O.
// Entity-kind agnostic over a field-name -> JSON-value snapshot rather than
// hardcoding per-entity field lists.

use crate::queue::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A field-name -> value snapshot of an entity at some point in time.
pub type EntitySnapshot = BTreeMap<String, serde_json::Value>;

const IGNORED_FIELDS: &[&str] = &["updated_at", "created_at", "synced"];

/// Resolution strategy chosen by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    ClientWins,
    ServerWins,
    Merge,
    Manual,
}

/// Output of the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictReport {
    pub has_conflict: bool,
    pub fields: Vec<String>,
    pub strategy: ResolutionStrategy,
}

pub struct Detector;

impl Detector {
    /// Compares local record `local` against server record `server`,
    /// both tagged `updated_at` (ms epoch), and classifies divergence.
    pub fn detect(
        kind: EntityKind,
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        t_local: i64,
        t_server: i64,
    ) -> ConflictReport {
        if t_server <= t_local {
            return ConflictReport {
                has_conflict: false,
                fields: Vec::new(),
                strategy: ResolutionStrategy::ClientWins,
            };
        }

        let fields = diverging_fields(local, server);

        if fields.is_empty() {
            return ConflictReport {
                has_conflict: false,
                fields: Vec::new(),
                strategy: ResolutionStrategy::ClientWins,
            };
        }

        let strategy = match kind {
            EntityKind::Session => {
                if fields.iter().any(|f| f == "is_completed" || f == "completed_at") {
                    ResolutionStrategy::ServerWins
                } else {
                    ResolutionStrategy::Merge
                }
            }
            // append-only, no conflict possible
            EntityKind::MlBatch => ResolutionStrategy::ClientWins,
            EntityKind::Rep => ResolutionStrategy::Manual,
        };

        let has_conflict = !matches!(strategy, ResolutionStrategy::ClientWins);

        ConflictReport {
            has_conflict,
            fields,
            strategy,
        }
    }

    /// Produces the resolved snapshot for `merge`: start from server,
    /// overlay local's non-timestamp fields, timestamp at `max(t_local, t_server)`.
    pub fn merge(
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        t_local: i64,
        t_server: i64,
    ) -> (EntitySnapshot, i64) {
        let mut merged = server.clone();
        for (key, value) in local {
            if IGNORED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }

        let resolved_at = t_local.max(t_server);
        merged.insert(
            "updated_at".to_string(),
            serde_json::Value::from(resolved_at),
        );

        (merged, resolved_at)
    }

    /// Produces the resolved snapshot for `server_wins`: the server record
    /// entirely, retaining only local's identity fields if absent upstream.
    pub fn server_wins(server: &EntitySnapshot) -> EntitySnapshot {
        server.clone()
    }
}

fn diverging_fields(local: &EntitySnapshot, server: &EntitySnapshot) -> Vec<String> {
    let mut keys: Vec<&String> = local.keys().chain(server.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter(|k| !IGNORED_FIELDS.contains(&k.as_str()))
        .filter(|k| local.get(*k) != server.get(*k))
        .map(|k| k.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(pairs: &[(&str, serde_json::Value)]) -> EntitySnapshot {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn server_not_newer_means_client_wins_no_conflict() {
        let local = snapshot(&[("valid_reps", json!(10))]);
        let server = snapshot(&[("valid_reps", json!(5))]);

        let report = Detector::detect(EntityKind::Session, &local, &server, 100, 50);
        assert!(!report.has_conflict);
        assert_eq!(report.strategy, ResolutionStrategy::ClientWins);
    }

    #[test]
    fn identical_fields_no_conflict_even_if_server_newer() {
        let local = snapshot(&[("valid_reps", json!(10))]);
        let server = snapshot(&[("valid_reps", json!(10))]);

        let report = Detector::detect(EntityKind::Session, &local, &server, 100, 200);
        assert!(!report.has_conflict);
    }

    #[test]
    fn session_completion_fields_force_server_wins() {
        let local = snapshot(&[("is_completed", json!(false))]);
        let server = snapshot(&[("is_completed", json!(true)), ("completed_at", json!(12345))]);

        let report = Detector::detect(EntityKind::Session, &local, &server, 100, 200);
        assert!(report.has_conflict);
        assert_eq!(report.strategy, ResolutionStrategy::ServerWins);
    }

    #[test]
    fn session_non_completion_divergence_is_mergeable() {
        let local = snapshot(&[("valid_reps", json!(12))]);
        let server = snapshot(&[("valid_reps", json!(11)), ("is_completed", json!(false))]);

        let report = Detector::detect(EntityKind::Session, &local, &server, 1_000, 6_000);
        assert!(report.has_conflict);
        assert_eq!(report.strategy, ResolutionStrategy::Merge);
        assert_eq!(report.fields, vec!["valid_reps".to_string()]);

        let (merged, resolved_at) = Detector::merge(&local, &server, 1_000, 6_000);
        assert_eq!(merged["valid_reps"], json!(12));
        assert_eq!(merged["is_completed"], json!(false));
        assert_eq!(resolved_at, 6_000);
    }

    #[test]
    fn ml_batch_is_always_client_wins() {
        let local = snapshot(&[("confidence", json!(0.9))]);
        let server = snapshot(&[("confidence", json!(0.1))]);

        let report = Detector::detect(EntityKind::MlBatch, &local, &server, 100, 200);
        assert!(!report.has_conflict);
        assert_eq!(report.strategy, ResolutionStrategy::ClientWins);
    }

    #[test]
    fn unrecognized_kind_falls_back_to_manual() {
        let local = snapshot(&[("x", json!(1))]);
        let server = snapshot(&[("x", json!(2))]);

        let report = Detector::detect(EntityKind::Rep, &local, &server, 100, 200);
        assert!(report.has_conflict);
        assert_eq!(report.strategy, ResolutionStrategy::Manual);
    }

    #[test]
    fn detection_is_pure_and_repeatable() {
        let local = snapshot(&[("valid_reps", json!(12))]);
        let server = snapshot(&[("valid_reps", json!(11))]);

        let r1 = Detector::detect(EntityKind::Session, &local, &server, 1_000, 6_000);
        let r2 = Detector::detect(EntityKind::Session, &local, &server, 1_000, 6_000);
        assert_eq!(r1.strategy, r2.strategy);
        assert_eq!(r1.fields, r2.fields);
    }
}
